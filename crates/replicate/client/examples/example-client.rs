//! Connects to a running replicate server, subscribes to an app-state
//! resource, and writes one element to it.

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use replicate_client::Client;
use replicate_common::resource_spec::ResourceSpec;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};
use url::Url;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
	#[clap(long)]
	url: Url,
	#[clap(long)]
	app: String,
}

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let env_filter = EnvFilter::builder()
		.with_default_directive(LevelFilter::INFO.into())
		.from_env_lossy();
	tracing_subscriber::fmt()
		.with_target(true)
		.with_level(true)
		.with_env_filter(env_filter)
		.init();

	let args = Args::parse();

	let mut client = Client::connect(args.url, None).await.wrap_err("failed to connect")?;
	info!("connected");

	let resource = client
		.subscribe(ResourceSpec::Table {
			app: args.app,
			path: Vec::new(),
		})
		.await
		.wrap_err("failed to subscribe")?;
	info!("subscribed as {resource:?}");

	let mapping = serde_json::json!({
		"ident": "",
		"value": {
			"type": "attributeValueRecord",
			"value": {
				"nrDataElements": {"type": "number", "value": 1.0},
				"firstId": {"type": "number", "value": 0.0},
				"columnPaths": {"type": "orderedSet", "value": [{"type": "str", "value": "greeting"}]},
			},
		},
	});
	let column = serde_json::json!({
		"ident": "greeting",
		"value": {
			"type": "orderedSet",
			"value": [{"type": "str", "value": "hello"}],
		},
	});
	let (revision, info_reply) = client
		.write(resource, vec![mapping, column])
		.await
		.wrap_err("failed to write")?;
	info!(revision, ?info_reply, "wrote greeting");

	Ok(())
}
