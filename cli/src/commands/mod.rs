pub mod admin;
pub mod feedback;
pub mod flag;
pub mod health;
pub mod session;
