use {
    anyhow::{Result, bail},
    clap::Subcommand,
    wagate_config::WagateConfig,
    wagate_sessions::{CredentialStore, validate_session_id},
};

#[derive(Subcommand)]
pub enum SessionAction {
    /// List session ids with stored credentials.
    List,
    /// Delete a session's stored credentials. Stop the gateway first.
    Purge {
        /// Session id.
        id: String,
    },
}

pub async fn handle_sessions(action: SessionAction, config: &WagateConfig) -> Result<()> {
    let store = wagate_gateway::server::open_credential_store(config)?;
    match action {
        SessionAction::List => {
            let ids = list(store.as_ref()).await?;
            if ids.is_empty() {
                println!("No stored sessions.");
            }
            for id in ids {
                println!("{id}");
            }
            Ok(())
        },
        SessionAction::Purge { id } => {
            purge(store.as_ref(), &id).await?;
            println!("Purged credentials for {id}");
            Ok(())
        },
    }
}

async fn list(store: &dyn CredentialStore) -> Result<Vec<String>> {
    Ok(store.list().await?)
}

async fn purge(store: &dyn CredentialStore, id: &str) -> Result<()> {
    validate_session_id(id)?;
    if store.load(id).await?.is_none() {
        bail!("no stored credentials for session '{id}'");
    }
    store.delete(id).await?;
    Ok(())
}
