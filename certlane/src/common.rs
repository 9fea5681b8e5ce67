//! Store construction shared by the subcommands

use std::sync::Arc;

use anyhow::Context;
use certlane_store::{ConsulStore, FileStore, Store};

use crate::{StoreArgs, StoreKind};

pub async fn init_store(args: &StoreArgs) -> anyhow::Result<Arc<dyn Store>> {
    match args.store {
        StoreKind::File => {
            let store = FileStore::new(&args.store_file_base)
                .await
                .with_context(|| {
                    format!("open file store at {}", args.store_file_base.display())
                })?;
            Ok(Arc::new(store))
        }
        StoreKind::Consul => {
            anyhow::ensure!(
                !args.store_consul_prefix.is_empty(),
                "store-consul-prefix must not be empty"
            );
            let store =
                ConsulStore::new(&args.store_consul_prefix).context("build consul client")?;
            Ok(Arc::new(store))
        }
    }
}
