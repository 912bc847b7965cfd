use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, bail, Context as _, Result};
use ingest_rtc::{
    select_host_address, AacOpusTransform, AudioTransform, Bridge, Config, MuteAudio, RtmpDialer,
    SdpKind, SessionDescription, Str0mSession, UpstreamDialer,
};
use rouille::{Request, Response, Server};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Shared by every signaling request.
struct Context {
    upstream: String,
    config: Config,
    dialer: Arc<dyn UpstreamDialer>,
    /// The one live bridge. A new offer replaces it.
    current: Mutex<Option<Arc<Bridge>>>,
}

fn init_log() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

pub fn main(upstream: &str) -> Result<()> {
    init_log();

    let config = Config::from_env().context("loading configuration")?;
    let dialer = Arc::new(RtmpDialer::new(config.upstream_connect_timeout()));

    let ctx = Arc::new(Context {
        upstream: upstream.to_string(),
        config,
        dialer,
        current: Mutex::new(None),
    });

    let listen = ctx.config.listen.clone();
    let handler_ctx = ctx.clone();
    let server = Server::new(listen.as_str(), move |request| web_request(request, &handler_ctx))
        .map_err(|e| anyhow!("starting the web server: {e}"))?;

    let port = server.server_addr().port();
    match select_host_address() {
        Some(host) => info!("Post offers to http://{}:{}", host, port),
        None => info!("Post offers to port {}", port),
    }
    info!(upstream = %ctx.upstream, "relaying");

    server.run();
    Ok(())
}

fn web_request(request: &Request, ctx: &Context) -> Response {
    info!("{} {}", request.method(), request.url());

    if request.method() != "POST" {
        return Response::empty_404();
    }

    match handle_offer(request, ctx) {
        Ok(answer) => Response::json(&answer),
        Err(e) => {
            warn!("offer failed: {:#}", e);
            Response::text(format!("{e:#}")).with_status_code(400)
        }
    }
}

fn handle_offer(request: &Request, ctx: &Context) -> Result<SessionDescription> {
    let mut data = request
        .data()
        .ok_or_else(|| anyhow!("request body already consumed"))?;

    let offer: SessionDescription = serde_json::from_reader(&mut data).context("parsing offer")?;
    if offer.kind != SdpKind::Offer {
        bail!("expected an offer, got {:?}", offer.kind);
    }

    let mut current = ctx.current.lock().unwrap_or_else(PoisonError::into_inner);

    // Release the previous viewer's socket before binding a new one.
    if let Some(previous) = current.take() {
        info!("replacing previous viewer");
        previous.close();
    }

    let transform: Box<dyn AudioTransform> = if ctx.config.mute_audio {
        Box::new(MuteAudio::default())
    } else {
        Box::new(AacOpusTransform::new())
    };

    let session = Arc::new(Str0mSession::new(&ctx.config.session)?);
    let bridge = Bridge::new(ctx.upstream.clone(), session, ctx.dialer.clone(), transform);

    bridge.set_remote_description(&offer.sdp, SdpKind::Offer)?;
    let sdp = bridge.local_description(SdpKind::Answer)?;
    *current = Some(bridge);

    Ok(SessionDescription {
        kind: SdpKind::Answer,
        sdp,
    })
}
