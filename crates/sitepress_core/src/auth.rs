use std::fmt;

use anyhow::{Context, Result};
use tracing::info;

use crate::args::quote_token;
use crate::exec::{ExecutionEngine, Invocation, ProcessRunner};

#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Reuse whatever session the tool already has.
    None,
    /// Interactive; the device code is echoed from the streamed output.
    DeviceCode,
    Password {
        username: String,
        password: String,
    },
    Certificate {
        certificate: String,
        password: Option<String>,
    },
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::DeviceCode => f.write_str("DeviceCode"),
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::Certificate { .. } => f.debug_struct("Certificate").finish_non_exhaustive(),
        }
    }
}

impl AuthMethod {
    pub fn login_invocation(&self) -> Option<Invocation> {
        match self {
            Self::None => None,
            Self::DeviceCode => Some(
                Invocation::parse("login --authType deviceCode")
                    .retryable(true)
                    .streaming(),
            ),
            Self::Password { username, password } => Some(
                Invocation::parse(&format!(
                    "login --authType password --userName {} --password {}",
                    quote_token(username),
                    quote_token(password)
                ))
                .retryable(true)
                .masking([password.clone()]),
            ),
            Self::Certificate {
                certificate,
                password,
            } => {
                let mut command = format!(
                    "login --authType certificate --certificateBase64Encoded {}",
                    quote_token(certificate)
                );
                if let Some(password) = password {
                    command.push_str(&format!(" --password {}", quote_token(password)));
                }
                let secrets = [Some(certificate.clone()), password.clone()];
                Some(
                    Invocation::parse(&command)
                        .retryable(true)
                        .masking(secrets.into_iter().flatten()),
                )
            }
        }
    }
}

pub fn login<R: ProcessRunner>(engine: &ExecutionEngine<R>, method: &AuthMethod) -> Result<()> {
    let Some(invocation) = method.login_invocation() else {
        return Ok(());
    };
    info!(method = ?method, "logging in");
    engine
        .execute(&invocation)
        .context("login failed")?;
    Ok(())
}
