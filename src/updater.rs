use std::{
    collections::HashSet,
    fmt::{Display, Formatter},
    time::Duration,
};
use tokio::{time, time::MissedTickBehavior};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use crate::{
    context::{Cancelled, Context},
    dns::{ensure_trailing_dot, Provider, ProviderError},
    endpoint::{Endpoint, RecordType},
    plan,
    router::Router,
};

/// Keeps CNAME records for every routed host pointed at `destination`.
#[derive(Debug)]
pub struct Updater<D: Provider, R: Router> {
    provider: D,
    router: R,

    destination: String,
    ttl: Option<u32>,
    update_interval: Duration,

    // Held for the duration of a pass.
    in_flight: Mutex<()>,
}

impl<D: Provider, R: Router> Updater<D, R> {
    pub fn new(provider: D, router: R, destination: String, update_interval: Duration) -> Self {
        Self {
            provider,
            router,
            destination,
            ttl: None,
            update_interval,
            in_flight: Mutex::new(()),
        }
    }

    pub fn ttl_mut(&mut self) -> &mut Option<u32> {
        &mut self.ttl
    }

    /// Reconciles on every tick until `ctx` is cancelled.
    pub async fn run(&self, ctx: &Context) -> Result<(), UpdateError<D::Error, R::Error>> {
        let mut interval = time::interval(self.update_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {}
            }

            let pass = ctx.with_timeout(self.update_interval);
            match self.reconcile(&pass).await {
                Ok(()) => {}
                Err(UpdateError::Cancelled(Cancelled::DeadlineExceeded)) => {
                    error!("reconciliation timed out");
                }
                Err(UpdateError::Cancelled(Cancelled::Cancelled)) => {
                    info!("reconciliation cancelled");
                }
                Err(e @ UpdateError::ProviderError(_)) if e.partially_applied() => {
                    warn!("changes were partially applied, will re-diff on next pass: {}", e);
                }
                Err(e) => {
                    error!("reconciliation returned an error: {}", e);
                }
            }
        }
    }

    /// Runs a single reconciliation pass.
    #[tracing::instrument(skip_all, level = "info")]
    pub async fn reconcile(&self, ctx: &Context) -> Result<(), UpdateError<D::Error, R::Error>> {
        let _guard = self.in_flight.lock().await;
        info!("reconciling records");

        let routes = ctx.run(self.router.get_routes())
            .await?
            .map_err(UpdateError::RouterError)?;
        for r in &routes {
            debug!(router = %r.id, host = %r.host, "found route");
        }
        let desired = self.desired(routes.into_iter().map(|r| r.host));

        let records = self.provider.records(ctx)
            .await
            .map_err(UpdateError::ProviderError)?;
        let current: Vec<Endpoint> = records.iter()
            .filter(|e| self.is_managed(e))
            .cloned()
            .collect();

        let changes = plan::calculate(&current, &desired);
        if changes.is_empty() {
            debug!(records = current.len(), "records up to date");
            return Ok(());
        }

        info!(
            create = ?changes.create.iter().map(|e| &e.dns_name).collect::<Vec<_>>(),
            update = ?changes.update_new.iter().map(|e| &e.dns_name).collect::<Vec<_>>(),
            delete = ?changes.delete.iter().map(|e| &e.dns_name).collect::<Vec<_>>(),
            "applying changes"
        );

        self.provider.apply_changes(ctx, &changes, Some(&records))
            .await
            .map_err(UpdateError::ProviderError)
    }

    /// One CNAME per unique host, in route order.
    fn desired(&self, hosts: impl Iterator<Item = String>) -> Vec<Endpoint> {
        let mut seen = HashSet::new();
        hosts.filter(|h| seen.insert(ensure_trailing_dot(h)))
            .map(|h| Endpoint {
                ttl: self.ttl,
                ..Endpoint::new(h, RecordType::Cname, vec![self.destination.clone()])
            })
            .collect()
    }

    /// Records this updater owns: CNAMEs pointing at the destination.
    fn is_managed(&self, e: &Endpoint) -> bool {
        let dest = ensure_trailing_dot(&self.destination);
        e.record_type == RecordType::Cname
            && e.comparable_targets().iter().any(|t| *t == dest)
    }
}

#[derive(Debug)]
pub enum UpdateError<P, R> {
    RouterError(R),
    ProviderError(P),
    Cancelled(Cancelled),
}

impl<P: ProviderError, R> UpdateError<P, R> {
    pub fn partially_applied(&self) -> bool {
        matches!(self, UpdateError::ProviderError(e) if e.partially_applied())
    }
}

impl<P, R> From<Cancelled> for UpdateError<P, R> {
    fn from(c: Cancelled) -> Self {
        UpdateError::Cancelled(c)
    }
}

impl<P: Display, R: Display> Display for UpdateError<P, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateError::RouterError(e) => write!(f, "router: {}", e),
            UpdateError::ProviderError(e) => write!(f, "provider: {}", e),
            UpdateError::Cancelled(e) => Display::fmt(e, f),
        }
    }
}

impl<P, R> std::error::Error for UpdateError<P, R>
where
    P: std::error::Error + 'static,
    R: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UpdateError::RouterError(e) => Some(e),
            UpdateError::ProviderError(e) => Some(e),
            UpdateError::Cancelled(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use crate::{
        dns::memory::InMemoryProvider,
        router::{MockRouter, Route},
    };
    use super::*;

    const DEST: &str = "lb.example.com";

    fn route(host: &str) -> Route {
        Route { id: format!("{}@docker", host), host: host.to_owned() }
    }

    fn router(hosts: &'static [&'static str]) -> MockRouter {
        let mut router = MockRouter::new();
        router.expect_get_routes()
            .returning(move || Ok(hosts.iter().map(|h| route(h)).collect()));
        router
    }

    fn cname(name: &str, target: &str) -> Endpoint {
        Endpoint::new(name, RecordType::Cname, vec![target.to_owned()])
    }

    fn names(records: &[Endpoint]) -> Vec<String> {
        let mut names: Vec<_> = records.iter().map(|e| ensure_trailing_dot(&e.dns_name)).collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn creates_missing_and_removes_stale_records() {
        let provider = InMemoryProvider::from(vec![
            cname("stale.example.com.", "lb.example.com."),
            cname("keep.example.com.", "lb.example.com."),
            cname("foreign.example.com.", "elsewhere.example.com."),
            Endpoint::new("a.example.com.", RecordType::A, vec!["10.0.0.1".into()]),
        ]);
        let updater = Updater::new(
            provider,
            router(&["keep.example.com", "new.example.com", "new.example.com"]),
            DEST.to_owned(),
            Duration::from_secs(60),
        );
        let ctx = Context::background();

        updater.reconcile(&ctx).await.unwrap();

        let records = updater.provider.records(&ctx).await.unwrap();
        assert_eq!(names(&records), vec![
            "a.example.com.",
            "foreign.example.com.",
            "keep.example.com.",
            "new.example.com.",
        ]);
    }

    #[tokio::test]
    async fn second_pass_is_a_no_op() {
        let mut updater = Updater::new(
            InMemoryProvider::new(),
            router(&["app.example.com"]),
            DEST.to_owned(),
            Duration::from_secs(60),
        );
        *updater.ttl_mut() = Some(120);
        let ctx = Context::background();

        updater.reconcile(&ctx).await.unwrap();
        let first = updater.provider.records(&ctx).await.unwrap();
        updater.reconcile(&ctx).await.unwrap();
        let second = updater.provider.records(&ctx).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0].ttl, Some(120));
    }

    #[tokio::test]
    async fn router_error_is_propagated() {
        let mut router = MockRouter::new();
        router.expect_get_routes()
            .returning(|| Err(io::Error::new(io::ErrorKind::ConnectionRefused, "traefik down")));
        let updater = Updater::new(InMemoryProvider::new(), router, DEST.to_owned(), Duration::from_secs(60));

        let err = updater.reconcile(&Context::background()).await.unwrap_err();

        assert!(matches!(err, UpdateError::RouterError(_)));
        assert!(!err.partially_applied());
        assert_eq!(err.to_string(), "router: traefik down");
    }

    #[tokio::test]
    async fn cancelled_pass_reports_cancellation() {
        let (ctx, handle) = Context::with_cancel();
        handle.cancel();
        let updater = Updater::new(InMemoryProvider::new(), router(&[]), DEST.to_owned(), Duration::from_secs(60));

        let err = updater.reconcile(&ctx).await.unwrap_err();
        assert!(matches!(err, UpdateError::Cancelled(Cancelled::Cancelled)));
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (ctx, handle) = Context::with_cancel();
        let updater = Updater::new(
            InMemoryProvider::new(),
            router(&["app.example.com"]),
            DEST.to_owned(),
            Duration::from_millis(10),
        );

        let run = updater.run(&ctx);
        let stop = async {
            time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        };
        let (res, ()) = tokio::join!(run, stop);

        assert!(res.is_ok());
        let records = updater.provider.records(&Context::background()).await.unwrap();
        assert_eq!(names(&records), vec!["app.example.com."]);
    }
}
