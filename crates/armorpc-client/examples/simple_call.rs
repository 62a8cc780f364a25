//! Issue one JSON-RPC call against an endpoint given on the command line.
//!
//! ```sh
//! cargo run --example simple_call -- http://127.0.0.1:8545/ system.listMethods
//! ```

use armorpc_client::{rpc_params, ServerProxy};

#[tokio::main]
async fn main() -> armorpc_client::Result<()> {
    let mut args = std::env::args().skip(1);
    let uri = args
        .next()
        .unwrap_or_else(|| "http://127.0.0.1:8545/".to_string());
    let method = args.next().unwrap_or_else(|| "system.listMethods".to_string());

    let proxy = ServerProxy::builder(uri).pool_connections(true).build()?;
    let result = proxy.call(&method, rpc_params![]).await?;
    println!("{}", serde_json::to_string_pretty(&result).unwrap_or_default());
    Ok(())
}
