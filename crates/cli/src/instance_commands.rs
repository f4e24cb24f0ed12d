use {
    anyhow::{Result, bail},
    clap::Subcommand,
    wagate_config::WagateConfig,
    wagate_gateway::routes::generate_instance_key,
    wagate_sessions::SqliteTenantDirectory,
};

#[derive(Subcommand)]
pub enum InstanceAction {
    /// Register an instance, or update the owner of an existing one.
    Add {
        #[arg(long)]
        owner: String,
        /// Instance key; generated when omitted.
        #[arg(long)]
        key: Option<String>,
        /// Callback URL for inbound messages.
        #[arg(long)]
        webhook: Option<String>,
    },
    /// Point an instance's inbound messages at a new URL.
    SetWebhook { key: String, url: String },
    /// List registered instances.
    List {
        #[arg(long)]
        owner: Option<String>,
    },
}

pub async fn handle_instances(action: InstanceAction, config: &WagateConfig) -> Result<()> {
    let pool = wagate_gateway::open_database(config).await?;
    let directory = SqliteTenantDirectory::new(pool);
    run(action, &directory).await
}

async fn run(action: InstanceAction, directory: &SqliteTenantDirectory) -> Result<()> {
    match action {
        InstanceAction::Add {
            owner,
            key,
            webhook,
        } => {
            let key = key.unwrap_or_else(generate_instance_key);
            let binding = directory
                .register_instance(&owner, &key, webhook.as_deref())
                .await?;
            println!("{}", binding.instance_key);
        },
        InstanceAction::SetWebhook { key, url } => {
            if !directory.set_webhook(&key, Some(&url)).await? {
                bail!("instance '{key}' not found");
            }
            println!("Webhook for {key} set to {url}");
        },
        InstanceAction::List { owner } => {
            for b in directory.list_instances(owner.as_deref()).await? {
                let state = if b.connected { "connected" } else { "-" };
                println!(
                    "{}  owner={}  session={}  {}  webhook={}",
                    b.instance_key,
                    b.owner_id,
                    b.session_id.as_deref().unwrap_or("-"),
                    state,
                    b.webhook_url.as_deref().unwrap_or("-"),
                );
            }
        },
    }
    Ok(())
}
