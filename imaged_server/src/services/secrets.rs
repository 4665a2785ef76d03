//! Secrets installation into the template checkout.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

/// Where templates expect the secrets archive, relative to the checkout root.
pub const SECRETS_FILE: &str = "secrets.tar";

#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("could not open secrets file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not install secrets file to {path}: {source}")]
    Install {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Copy `source` to `<templates_root>/secrets.tar`, overwriting any previous
/// copy, and fsync it before returning.
pub async fn install(source: &Path, templates_root: &Path) -> Result<PathBuf, SecretsError> {
    let mut src = tokio::fs::File::open(source)
        .await
        .map_err(|e| SecretsError::Open {
            path: source.to_path_buf(),
            source: e,
        })?;

    let dest = templates_root.join(SECRETS_FILE);
    let install_err = |e| SecretsError::Install {
        path: dest.clone(),
        source: e,
    };

    let mut dst = tokio::fs::File::create(&dest).await.map_err(install_err)?;
    tokio::io::copy(&mut src, &mut dst)
        .await
        .map_err(install_err)?;
    dst.flush().await.map_err(install_err)?;
    dst.sync_all().await.map_err(install_err)?;

    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("secrets-src.tar");
        let checkout = dir.path().join("checkout");
        std::fs::create_dir_all(&checkout).unwrap();

        std::fs::write(checkout.join(SECRETS_FILE), b"stale and much longer").unwrap();
        std::fs::write(&source, b"fresh").unwrap();

        let dest = install(&source, &checkout).await.unwrap();
        assert_eq!(dest, checkout.join(SECRETS_FILE));
        assert_eq!(std::fs::read(&dest).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = install(&dir.path().join("nope"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, SecretsError::Open { .. }));
        assert!(!dir.path().join(SECRETS_FILE).exists());
    }
}
