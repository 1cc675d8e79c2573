use std::path::Path;

use anyhow::Result;
use calmirror_core::{MirrorConfig, Role};
use calmirror_provider_google::auth;

pub async fn run(role: Role, config_path: Option<&Path>) -> Result<()> {
    let config = MirrorConfig::load(config_path)?;

    println!("Authorizing the {role} account...");

    let tokens = auth::authenticate(&config, role).await?;

    println!(
        "\nSaved tokens to {}\n",
        config.token_path(role).display()
    );
    println!(
        "=== Or set {}_TOKENS_JSON to ===\n",
        role.as_str().to_uppercase()
    );
    println!("{}", serde_json::to_string(&tokens)?);

    Ok(())
}
