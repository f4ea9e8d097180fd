use serde_json::json;

pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

pub fn exit_error(message: &str, docs_hint: Option<&str>) -> ! {
    let mut err = json!({
        "error": "cli_error",
        "message": message
    });
    if let Some(hint) = docs_hint {
        err["docs_hint"] = json!(hint);
    }
    eprintln!("{}", serde_json::to_string_pretty(&err).unwrap());
    std::process::exit(1);
}

/// Execute an API request, print the JSON response, return a structured
/// exit code.
///
/// Exit codes: 0=success (2xx), 1=client error (4xx), 2=server error (5xx),
///             3=connection error, 4=usage error
pub async fn api_request(
    api_url: &str,
    method: reqwest::Method,
    path: &str,
    user_id: Option<&str>,
    body: Option<serde_json::Value>,
    query: &[(String, String)],
) -> i32 {
    let url = match reqwest::Url::parse(&format!("{api_url}{path}")) {
        Ok(mut u) => {
            if !query.is_empty() {
                let mut q = u.query_pairs_mut();
                for (k, v) in query {
                    q.append_pair(k, v);
                }
            }
            u
        }
        Err(e) => {
            let err = json!({
                "error": "cli_error",
                "message": format!("Invalid URL: {api_url}{path}: {e}")
            });
            eprintln!("{}", serde_json::to_string_pretty(&err).unwrap());
            return 4;
        }
    };

    let mut req = client().request(method, url);

    if let Some(id) = user_id {
        req = req.header("x-user-id", id);
    }

    if let Some(b) = body {
        req = req.json(&b);
    }

    let resp = match req.send().await {
        Ok(r) => r,
        Err(e) => {
            let err = json!({
                "error": "connection_error",
                "message": format!("{e}"),
                "docs_hint": "Is the API server running? Check ESSAYLAB_API_URL."
            });
            eprintln!("{}", serde_json::to_string_pretty(&err).unwrap());
            return 3;
        }
    };

    let status = resp.status().as_u16();
    let exit_code = match status {
        200..=299 => 0,
        400..=499 => 1,
        _ => 2,
    };

    let resp_body: serde_json::Value = match resp.json().await {
        Ok(v) => v,
        Err(e) => json!({"raw_error": format!("Failed to parse response as JSON: {e}")}),
    };

    let formatted = serde_json::to_string_pretty(&resp_body).unwrap();
    if exit_code == 0 {
        println!("{formatted}");
    } else {
        eprintln!("{formatted}");
    }

    exit_code
}

/// Read text from a file path or stdin (when path is "-").
pub fn read_text_from_file(path: &str) -> Result<String, String> {
    if path == "-" {
        let mut buf = String::new();
        std::io::Read::read_to_string(&mut std::io::stdin(), &mut buf)
            .map_err(|e| format!("Failed to read stdin: {e}"))?;
        Ok(buf)
    } else {
        std::fs::read_to_string(path).map_err(|e| format!("Failed to read file '{path}': {e}"))
    }
}
