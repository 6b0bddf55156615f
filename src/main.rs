use tracing::{error, info};
use wallet_sync::{ConnectionDescriptor, backend_from_descriptor};
use wallet_sync::backend::WalletCallbacks;

#[tokio::main(flavor = "current_thread")]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	let args: Vec<String> = std::env::args().skip(1).collect();
	let descriptor = match args.as_slice() {
		[uri] => match ConnectionDescriptor::nwc(uri) {
			Ok(descriptor) => descriptor,
			Err(e) => {
				error!("Bad connection URI: {}", e);
				return;
			}
		},
		[base_url, api_key] => ConnectionDescriptor::custodial(base_url, api_key),
		_ => {
			error!("Usage: wallet-sync <nwc-uri> | wallet-sync <base-url> <api-key>");
			return;
		}
	};

	let backend = match backend_from_descriptor(descriptor) {
		Ok(backend) => backend,
		Err(e) => {
			error!("Failed to create backend: {}", e);
			return;
		}
	};

	info!("Starting wallet sync service");
	let callbacks = WalletCallbacks {
		balance: Box::new(|sats| info!("Balance: {} sats", sats)),
		payments: Box::new(|| info!("Payment ledger updated")),
		receive_code: Box::new(|| info!("Receive code available")),
		error: Box::new(|e| error!("Wallet error: {}", e)),
	};
	if let Err(e) = backend.start(callbacks).await {
		error!("Failed to start wallet sync: {}", e);
		return;
	}

	if let Err(e) = tokio::signal::ctrl_c().await {
		error!("Failed to listen for shutdown signal: {}", e);
	}

	info!("Shutting down");
	backend.stop().await;
	info!("Final balance: {} sats", backend.balance());
	for payment in &backend.payments() {
		info!("  {}", payment);
	}
}
