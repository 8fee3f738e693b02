use crate::{
    context::Context,
    dns::memory::InMemoryProvider,
    router::traefik::TraefikRouter,
    settings::{LogFormat, Provider, Settings},
    updater::Updater,
};
use std::{mem, time::Duration};
use tracing::{error, info};

mod context;
mod dns;
mod endpoint;
mod plan;
mod router;
mod settings;
mod updater;

build_info::build_info!(fn build_info);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Settings::new()?;
    init_logging(&cfg)?;

    let info = build_info();
    info!(version = %info.crate_info.version, "starting {}", info.crate_info.name);

    let (ctx, cancel) = Context::with_cancel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received interrupt"),
            Err(e) => error!("failed to listen for interrupt: {}", e),
        }
        cancel.cancel();
    });

    run(cfg, &ctx).await
}

fn init_logging(cfg: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let builder = tracing_subscriber::fmt().with_max_level(cfg.log_level()?);
    match cfg.log_format {
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.finish())?,
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
    }
    Ok(())
}

async fn run(mut cfg: Settings, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let router = TraefikRouter::new(mem::take(&mut cfg.traefik_url))?;
    let update_interval = cfg.update_interval()?;

    match mem::replace(&mut cfg.provider, Provider::InMemory) {
        #[cfg(feature = "aws")]
        Provider::Route53(r53) => run_route53(router, cfg, r53, update_interval, ctx).await,
        #[cfg(feature = "cf")]
        Provider::Cloudflare(cf) => run_cloudflare(router, cfg, cf, update_interval, ctx).await,
        Provider::InMemory => {
            let updater = updater(InMemoryProvider::new(), router, cfg, update_interval);
            Ok(updater.run(ctx).await?)
        }
    }
}

fn updater<D: dns::Provider, R: router::Router>(
    provider: D,
    router: R,
    cfg: Settings,
    update_interval: Duration,
) -> Updater<D, R> {
    let mut updater = Updater::new(provider, router, cfg.destination, update_interval);
    *updater.ttl_mut() = cfg.ttl;
    updater
}

#[cfg(feature = "aws")]
async fn run_route53(
    router: TraefikRouter,
    cfg: Settings,
    r53: settings::Route53Settings,
    update_interval: Duration,
    ctx: &Context,
) -> Result<(), Box<dyn std::error::Error>> {
    let aws_cfg = aws_config::from_env().load().await;
    let mut provider = dns::route53::Route53Provider::new(&aws_cfg, cfg.zone_id.clone());

    if let Some(ttl) = r53.ttl {
        *provider.ttl_mut() = ttl;
    }

    let updater = updater(provider, router, cfg, update_interval);
    Ok(updater.run(ctx).await?)
}

#[cfg(feature = "cf")]
async fn run_cloudflare(
    router: TraefikRouter,
    cfg: Settings,
    mut cf: settings::CloudflareSettings,
    update_interval: Duration,
    ctx: &Context,
) -> Result<(), Box<dyn std::error::Error>> {
    let credentials = match (cf.resolve_token()?, cf.email.take(), cf.api_key.take()) {
        (Some(token), _, _) => cloudflare::framework::auth::Credentials::UserAuthToken { token },
        (None, Some(email), Some(key)) => cloudflare::framework::auth::Credentials::UserAuthKey { email, key },
        _ => return Err("missing cloudflare credentials: set token, token_file or email and api_key".into()),
    };

    let mut provider = dns::cloudflare::CloudflareProvider::new(credentials, cfg.zone_id.clone())?;

    if let Some(ttl) = cf.ttl {
        *provider.ttl_mut() = ttl;
    }
    if let Some(proxied) = cf.proxied {
        *provider.proxied_mut() = proxied;
    }

    let updater = updater(provider, router, cfg, update_interval);
    Ok(updater.run(ctx).await?)
}
