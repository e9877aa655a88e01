use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::Result;

/// How to prove we may join a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Credentials {
    Password {
        password: String,
    },
    Token {
        token: String,
    },
    /// ask an authorisation server for a token, falling back to the password
    /// when it declines to issue one
    AuthServer {
        #[serde(rename = "authServer")]
        auth_server: String,
        location: String,
        password: String,
    },
}

impl From<&str> for Credentials {
    fn from(password: &str) -> Self {
        Credentials::Password {
            password: password.to_string(),
        }
    }
}

/// What ends up in the `join` message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinAuth {
    pub password: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    location: &'a str,
    username: &'a str,
    password: &'a str,
}

impl Credentials {
    pub async fn resolve(&self, username: &str) -> Result<JoinAuth> {
        Ok(match self {
            Credentials::Password { password } => JoinAuth {
                password: Some(password.clone()),
                token: None,
            },
            Credentials::Token { token } => JoinAuth {
                password: None,
                token: Some(token.clone()),
            },
            Credentials::AuthServer {
                auth_server,
                location,
                password,
            } => match fetch_token(auth_server, location, username, password).await? {
                Some(token) => JoinAuth {
                    password: None,
                    token: Some(token),
                },
                None => JoinAuth {
                    password: Some(password.clone()),
                    token: None,
                },
            },
        })
    }
}

async fn fetch_token(
    auth_server: &str,
    location: &str,
    username: &str,
    password: &str,
) -> Result<Option<String>> {
    info!("Requesting a token from {}", auth_server);
    let response = reqwest::Client::new()
        .post(auth_server)
        .json(&AuthRequest {
            location,
            username,
            password,
        })
        .send()
        .await?;
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await?;
    interpret_auth_response(status, content_type.as_deref(), body)
}

/// `None` means the server has no token for us and the password should be
/// used instead.
pub(crate) fn interpret_auth_response(
    status: u16,
    content_type: Option<&str>,
    body: String,
) -> Result<Option<String>> {
    if status == 204 {
        return Ok(None);
    }
    if !(200..300).contains(&status) {
        bail!("authorisation server returned status {}", status);
    }
    if body.is_empty() {
        return Ok(None);
    }
    let mime = content_type
        .and_then(|c| c.split(';').next())
        .map(|m| m.trim().to_ascii_lowercase());
    match mime.as_deref() {
        Some("application/jwt") => Ok(Some(body.trim().to_string())),
        other => bail!(
            "authorisation server returned unexpected content type {:?}",
            other
        ),
    }
}
