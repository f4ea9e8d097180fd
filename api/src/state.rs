use std::sync::Arc;

use sqlx::PgPool;

use crate::ai::HttpChatProvider;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub ai: Arc<HttpChatProvider>,
}
