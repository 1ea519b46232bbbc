//! Ravel greeter demo.
//!
//! Starts a handful of greeter peers and one client on an in-process broker.
//! The client stores its name in a session and calls the greeters; each
//! greeter reads the name from the caller's session and stamps itself into
//! it before answering.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use ravel_session::{
	Attr, CallContext, Error, Invocation, MemoryBroker, Namespace, Notification, Peer, PeerConfig, PeerId, Result,
	Revision, command_handler, event_handler,
};
use tracing::info;

const UPDATE_ATTEMPTS: usize = 3;

/// Demo command line arguments.
#[derive(Parser, Debug)]
#[command(name = "ravel-demo")]
#[command(about = "Greeter peers exchanging calls and session state")]
struct Args {
	/// Number of greeter peers
	#[arg(short, long, default_value_t = 2)]
	peers: usize,

	/// Number of calls the client makes
	#[arg(short, long, default_value_t = 6)]
	calls: usize,

	/// Peer configuration file
	#[arg(long, value_name = "PATH")]
	config: Option<PathBuf>,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();
	setup_tracing(args.verbose);

	let config = match &args.config {
		Some(path) => PeerConfig::load(path)?,
		None => PeerConfig::default().with_default_timeout(Duration::from_secs(5)),
	};
	let broker = MemoryBroker::new();
	let greeter_ns = Namespace::new("greeter")?;
	let audit_ns = Namespace::new("audit")?;

	let mut greeters = Vec::with_capacity(args.peers);
	for _ in 0..args.peers {
		let peer = Peer::connect(Arc::new(broker.clone()), config.clone()).await?;
		let me = peer.id();
		peer.listen(greeter_ns.clone(), command_handler(move |invocation| greet(invocation, me)))
			.await?;
		let observer = peer.session()?;
		observer.listen(audit_ns.clone(), event_handler(move |notification| audit(notification, me))).await?;
		info!(peer = %me, "greeter ready");
		greeters.push(peer);
	}

	let client = Peer::connect(Arc::new(broker.clone()), config).await?;
	let session = client.session()?;
	let ctx = CallContext::background();
	session.head()?.update(&ctx, vec![Attr::freeze("name", "ravel")]).await?;

	for call in 0..args.calls {
		let ctx = CallContext::background().with_timeout(Duration::from_secs(2));
		let reply = session.call(&ctx, &greeter_ns, "hello", Bytes::new()).await?;
		let text = String::from_utf8_lossy(&reply).into_owned();
		info!(call, rev = session.head()?.rev(), reply = %text, "greeted");
		session.notify(&ctx, &audit_ns, "greeted", reply).await?;
	}

	let head = session.head()?;
	let attrs = head.get_many(&ctx, &["name", "greeted_by"]).await?;
	info!(
		rev = head.rev(),
		name = %attrs["name"].value,
		greeted_by = %attrs["greeted_by"].value,
		"final session state"
	);
	session.close(&ctx).await?;

	client.close().await?;
	for peer in greeters {
		peer.close().await?;
	}
	Ok(())
}

async fn greet(invocation: Invocation, me: PeerId) {
	let ctx = invocation.context();
	let reply = match invocation.revision() {
		Some(revision) => greeting(&ctx, revision, me).await,
		None => Err(Error::NotFound),
	};
	match reply {
		Ok(text) => invocation.responder().done(Bytes::from(text)).await,
		Err(error) => invocation.responder().error(error).await,
	};
}

async fn greeting(ctx: &CallContext, revision: &Revision, me: PeerId) -> Result<String> {
	let name = revision.get(ctx, "name").await?;
	let mut current = revision.clone();
	for attempt in 1..=UPDATE_ATTEMPTS {
		match current.update(ctx, vec![Attr::set("greeted_by", me.to_string())]).await {
			Ok(_) => break,
			Err(error) if error.should_retry() && attempt < UPDATE_ATTEMPTS => {
				current = current.refresh(ctx).await?;
			}
			Err(error) => return Err(error),
		}
	}
	Ok(format!("hello, {} (from {me})", name.value))
}

async fn audit(notification: Notification, me: PeerId) {
	info!(
		peer = %me,
		origin = %notification.origin(),
		topic = notification.topic(),
		rev = notification.revision().map(Revision::rev),
		"audit"
	);
}

fn setup_tracing(verbose: bool) {
	use tracing_subscriber::EnvFilter;

	let filter = EnvFilter::try_from_env("RAVEL_LOG").unwrap_or_else(|_| {
		if verbose {
			EnvFilter::new("ravel_session=debug,ravel_rpc=debug,info")
		} else {
			EnvFilter::new("info")
		}
	});
	tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}
