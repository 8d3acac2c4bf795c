use nbexec_shared::ExecutionResult;
use reqwest::{blocking::Client, Url};
use serde_json::Value;

/// joins the server url and a route without doubling the slash
pub fn endpoint(url: &str, route: &str) -> String {
    format!("{}/{}", url.trim_end_matches('/'), route.trim_start_matches('/'))
}

/// the job id is appended as one percent-encoded path segment
pub fn execute_url(server_url: &str, job_id: &str) -> Result<Url, String> {
    let mut url =
        Url::parse(server_url).map_err(|e| format!("invalid server url {}: {}", server_url, e))?;
    url.path_segments_mut()
        .map_err(|_| format!("invalid server url {}: cannot hold a path", server_url))?
        .pop_if_empty()
        .extend(["nb", "v1", "execute", job_id]);
    Ok(url)
}

pub fn execute(http_client: &Client, url: &str, job_id: &str) -> Result<ExecutionResult, String> {
    let request = http_client
        .post(execute_url(url, job_id)?)
        .build()
        .map_err(|e| format!("error building the request: {}", e))?;

    match http_client.execute(request) {
        Ok(response) if response.status().is_success() => response
            .json()
            .map_err(|e| format!("unexpected response body: {}", e)),
        Ok(response) => Err(format!("unexpected response: {:?}", response)),
        Err(e) => Err(format!("error executing request: {}", e)),
    }
}

pub fn version(http_client: &Client, url: &str) -> Result<String, String> {
    let request = http_client
        .get(endpoint(url, "nb/v1/version"))
        .build()
        .map_err(|e| format!("error building the request: {}", e))?;

    match http_client.execute(request) {
        Ok(response) if response.status().is_success() => {
            let body: Value = response
                .json()
                .map_err(|e| format!("unexpected response body: {}", e))?;
            Ok(describe_version(&body))
        }
        Ok(response) => Err(format!("unexpected response: {:?}", response)),
        Err(e) => Err(format!("error executing request: {}", e)),
    }
}

fn describe_version(body: &Value) -> String {
    format!(
        "api {} (server {})",
        body["version"].as_str().unwrap_or("?"),
        body["package"].as_str().unwrap_or("?")
    )
}
