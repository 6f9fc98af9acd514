//! Private key file SSH authentication.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::session::Session;

use super::accepted;
use super::traits::AuthStrategy;

/// Private key file authentication strategy.
///
/// Currently supports passphrase-less keys. For RSA keys the engine picks
/// the best hash algorithm the server supports.
pub struct KeyAuth {
    key_path: PathBuf,
}

impl KeyAuth {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(&self, session: &Session) -> Result<bool> {
        debug!("Trying key file {:?}", self.key_path);
        let status = session.userauth_publickey_file(&self.key_path).await?;
        Ok(accepted(status))
    }

    fn name(&self) -> &'static str {
        "key"
    }
}
