//! CNI plugin shim: environment + stdin → daemon RPC → stdout JSON.

use std::collections::BTreeMap;

use tamarack::cni::plugin;

#[tokio::main]
async fn main() {
    let env: BTreeMap<String, String> = std::env::vars().collect();
    let stdin = plugin::read_stdin().unwrap_or_default();

    let output = plugin::run(&env, &stdin).await;
    if !output.stdout.is_empty() {
        println!("{}", output.stdout);
    }
    std::process::exit(output.exit_code);
}
