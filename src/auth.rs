use anyhow::{anyhow, Result};
use serde::Deserialize;

/// Session as returned by the identity host's session-get endpoint. The DID
/// it reports is authoritative for all ownership checks.
#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    pub did: String,
    #[serde(default)]
    pub handle: String,
}

pub async fn get_session(
    client: &reqwest::Client,
    service: &str,
    access_jwt: &str,
) -> Result<Session> {
    let url = format!(
        "{}/xrpc/com.atproto.server.getSession",
        service.trim_end_matches('/')
    );

    let response = client.get(url).bearer_auth(access_jwt).send().await?;

    if !response.status().is_success() {
        return Err(anyhow!(
            "session endpoint returned {}",
            response.status()
        ));
    }

    Ok(response.json().await?)
}
