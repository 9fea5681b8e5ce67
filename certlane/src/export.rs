//! The `export` subcommand: dump a site's stored certificate chain and
//! private key as `<name>.crt` / `<name>.key` files.

use std::path::Path;

use anyhow::Context;
use tokio::io::AsyncWriteExt;

use crate::{ExportArgs, common};

pub async fn run(args: ExportArgs) -> anyhow::Result<()> {
    let store = common::init_store(&args.store).await?;

    for name in &args.name {
        let resource = store
            .fetch_resource(name)
            .await
            .with_context(|| format!("fetch resource for '{name}'"))?;

        write_secret_file(&args.dest.join(format!("{name}.crt")), &resource.certificate).await?;
        write_secret_file(&args.dest.join(format!("{name}.key")), &resource.private_key).await?;
        tracing::info!(site = name.as_str(), "exported certificate and key");
    }

    println!("done");
    Ok(())
}

/// Owner-only file; keys travel through here.
async fn write_secret_file(path: &Path, content: &[u8]) -> anyhow::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(path)
        .await
        .with_context(|| format!("create {}", path.display()))?;
    file.write_all(content)
        .await
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn secret_files_are_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("example.key");
        write_secret_file(&path, b"key material").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"key material");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
