use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr};
use cloudflare::endpoints::dns::{CreateDnsRecord, CreateDnsRecordParams, DeleteDnsRecord, DnsContent, DnsRecord, ListDnsRecords, ListDnsRecordsParams, UpdateDnsRecord, UpdateDnsRecordParams};
use cloudflare::framework::async_api::{ApiClient, Client};
use cloudflare::framework::auth::Credentials;
use cloudflare::framework::{Environment, HttpApiClientConfig};
use cloudflare::framework::response::ApiFailure;
use thiserror::Error;
use tracing::debug;
use crate::{
    context::{Cancelled, Context},
    endpoint::{Endpoint, RecordType},
    plan::Changes,
};
use super::{difference, Provider, ProviderError};

const DEFAULT_TTL: u32 = 300;
const DEFAULT_PROXIED: bool = false;

/// Prefix of the `provider_specific` keys holding record ids, one per target.
const RECORD_ID_PREFIX: &str = "cloudflare/record-id/";

type RecordIds = HashMap<(String, RecordType, String), String>;

/// Cloudflare zone backend.
///
/// Cloudflare stores one record per target, so a changeset is applied as a
/// sequence of single-record requests. A failure after some of them
/// succeeded is reported as [`CloudflareError::PartiallyApplied`].
pub struct CloudflareProvider {
    zone_id: String,

    client: Client,

    ttl: u32,
    proxied: bool,
}

enum Op<'a> {
    Create { name: &'a str, content: DnsContent, ttl: u32 },
    Update { id: String, name: &'a str, content: DnsContent, ttl: u32 },
    Delete { id: String },
}

impl CloudflareProvider {
    pub fn new(creds: Credentials, zone_id: String) -> Result<Self, CloudflareError> {
        let client = Client::new(
            creds,
            HttpApiClientConfig::default(),
            Environment::Production,
        ).map_err(|e| match e.downcast::<reqwest::Error>() {
            Ok(e) => CloudflareError::NewClientError(e),
            Err(e) => CloudflareError::Client(e.to_string()),
        })?;

        Ok(Self {
            zone_id,
            client,
            ttl: DEFAULT_TTL,
            proxied: DEFAULT_PROXIED,
        })
    }

    pub fn ttl_mut(&mut self) -> &mut u32 { &mut self.ttl }

    pub fn proxied_mut(&mut self) -> &mut bool { &mut self.proxied }

    async fn list_records(&self) -> Result<Vec<DnsRecord>, CloudflareError> {
        let request = ListDnsRecords {
            zone_identifier: &self.zone_id,
            params: ListDnsRecordsParams {
                record_type: None,
                name: None,
                page: None,
                per_page: Some(5000),
                order: None,
                direction: None,
                search_match: None,
            },
        };
        Ok(self.client.request(&request).await?.result)
    }

    /// Resolves the record ids needed by `changes`, listing the zone once if
    /// neither the endpoints nor `cached` carry all of them.
    async fn record_ids(
        &self,
        ctx: &Context,
        changes: &Changes,
        cached: Option<&[Endpoint]>,
    ) -> Result<RecordIds, CloudflareError> {
        let mut ids = known_ids(changes, cached);

        if missing_ids(changes, &ids) {
            debug!("record ids missing, listing zone");
            for record in ctx.run(self.list_records()).await?? {
                if let Some((record_type, target)) = record_target(&record.content) {
                    ids.insert((dns_name(&record.name), record_type, target_key(record_type, &target)), record.id);
                }
            }
        }

        Ok(ids)
    }

    async fn execute(&self, op: Op<'_>) -> Result<(), CloudflareError> {
        match op {
            Op::Create { name, content, ttl } => {
                let request = CreateDnsRecord {
                    zone_identifier: &self.zone_id,
                    params: CreateDnsRecordParams {
                        ttl: Some(ttl),
                        priority: None,
                        proxied: Some(self.proxied),
                        name,
                        content,
                    },
                };
                self.client.request(&request).await?;
            }
            Op::Update { id, name, content, ttl } => {
                let request = UpdateDnsRecord {
                    zone_identifier: &self.zone_id,
                    identifier: &id,
                    params: UpdateDnsRecordParams {
                        ttl: Some(ttl),
                        proxied: Some(self.proxied),
                        name,
                        content,
                    },
                };
                self.client.request(&request).await?;
            }
            Op::Delete { id } => {
                let request = DeleteDnsRecord {
                    zone_identifier: &self.zone_id,
                    identifier: &id,
                };
                self.client.request(&request).await?;
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl Provider for CloudflareProvider {
    type Error = CloudflareError;

    #[tracing::instrument(skip_all)]
    async fn records(&self, ctx: &Context) -> Result<Vec<Endpoint>, Self::Error> {
        let records = ctx.run(self.list_records()).await??;
        debug!("got {} records from Cloudflare", records.len());

        Ok(group_records(records.into_iter()
            .filter_map(|r| {
                let (record_type, target) = record_target(&r.content)?;
                Some((r.name, record_type, target, r.ttl, r.id))
            })))
    }

    #[tracing::instrument(skip_all)]
    async fn apply_changes(
        &self,
        ctx: &Context,
        changes: &Changes,
        cached: Option<&[Endpoint]>,
    ) -> Result<(), Self::Error> {
        if changes.is_empty() {
            return Ok(());
        }

        let ids = self.record_ids(ctx, changes, cached).await?;
        let ops = plan_ops(changes, &ids, self.ttl)?;

        run_ops(ops, |op| async move {
            ctx.run(self.execute(op)).await.unwrap_or_else(|c| Err(c.into()))
        }).await
    }
}

fn known_ids(changes: &Changes, cached: Option<&[Endpoint]>) -> RecordIds {
    let mut ids = RecordIds::new();
    let known = changes.delete.iter()
        .chain(&changes.update_old)
        .chain(cached.unwrap_or_default());
    for e in known {
        collect_ids(e, &mut ids);
    }
    ids
}

fn missing_ids(changes: &Changes, ids: &RecordIds) -> bool {
    changes.delete.iter()
        .chain(&changes.update_old)
        .flat_map(|e| e.targets.iter().map(move |t| id_key(e, t)))
        .any(|k| !ids.contains_key(&k))
}

fn content(record_type: RecordType, target: &str) -> Result<DnsContent, CloudflareError> {
    let bad = || CloudflareError::BadTarget(target.to_owned());
    Ok(match record_type {
        RecordType::A => DnsContent::A { content: target.parse::<Ipv4Addr>().map_err(|_| bad())? },
        RecordType::Aaaa => DnsContent::AAAA { content: target.parse::<Ipv6Addr>().map_err(|_| bad())? },
        RecordType::Cname => DnsContent::CNAME { content: trim_dot(target).to_owned() },
        RecordType::Txt => DnsContent::TXT { content: target.to_owned() },
    })
}

/// Turns `changes` into single-record requests.
///
/// Within an update, removed targets are rewritten in place with added ones
/// first, so a CNAME never has two records at once. Leftover removals run
/// before leftover additions.
fn plan_ops<'a>(changes: &'a Changes, ids: &RecordIds, default_ttl: u32) -> Result<Vec<Op<'a>>, CloudflareError> {
    let lookup = |e: &Endpoint, t: &str| {
        ids.get(&id_key(e, t))
            .cloned()
            .ok_or_else(|| CloudflareError::RecordNotFound(format!("{} {} {}", e.dns_name, e.record_type, t)))
    };
    let mut ops = Vec::new();

    for e in &changes.create {
        for t in &e.targets {
            ops.push(Op::Create {
                name: trim_dot(&e.dns_name),
                content: content(e.record_type, t)?,
                ttl: e.ttl.unwrap_or(default_ttl),
            });
        }
    }

    for (old, new) in changes.updates() {
        let ttl = new.ttl.or(old.ttl).unwrap_or(default_ttl);
        let name = trim_dot(&new.dns_name);
        let old_targets = targets(old);
        let new_targets = targets(new);
        let diff = difference(&old_targets, &new_targets);
        let paired = diff.remove.len().min(diff.add.len());

        for (&from, &to) in diff.remove.iter().zip(&diff.add) {
            ops.push(Op::Update {
                id: lookup(old, from)?,
                name,
                content: content(new.record_type, to)?,
                ttl,
            });
        }
        for &t in &diff.remove[paired..] {
            ops.push(Op::Delete { id: lookup(old, t)? });
        }
        for &t in &diff.add[paired..] {
            ops.push(Op::Create {
                name,
                content: content(new.record_type, t)?,
                ttl,
            });
        }
        if old.ttl != Some(ttl) {
            for &t in &diff.leave {
                ops.push(Op::Update {
                    id: lookup(old, t)?,
                    name,
                    content: content(new.record_type, t)?,
                    ttl,
                });
            }
        }
    }

    for e in &changes.delete {
        for t in &e.targets {
            ops.push(Op::Delete { id: lookup(e, t)? });
        }
    }

    Ok(ops)
}

/// Executes `ops` in order, stopping at the first failure.
async fn run_ops<T, F, Fut>(ops: Vec<T>, mut execute: F) -> Result<(), CloudflareError>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<(), CloudflareError>>,
{
    let total = ops.len();

    for (applied, op) in ops.into_iter().enumerate() {
        if let Err(e) = execute(op).await {
            return Err(if applied == 0 {
                e
            } else {
                CloudflareError::PartiallyApplied { applied, total, source: Box::new(e) }
            });
        }
    }

    Ok(())
}

/// Maps record content to a supported type and its target string.
fn record_target(content: &DnsContent) -> Option<(RecordType, String)> {
    match content {
        DnsContent::A { content } => Some((RecordType::A, content.to_string())),
        DnsContent::AAAA { content } => Some((RecordType::Aaaa, content.to_string())),
        DnsContent::CNAME { content } => Some((RecordType::Cname, content.clone())),
        DnsContent::TXT { content } => Some((RecordType::Txt, content.clone())),
        _ => None,
    }
}

/// Groups per-target records into endpoints, keeping first-seen order.
fn group_records<I>(records: I) -> Vec<Endpoint>
where
    I: Iterator<Item = (String, RecordType, String, u32, String)>,
{
    let mut positions: HashMap<(String, RecordType), usize> = HashMap::new();
    let mut endpoints: Vec<Endpoint> = Vec::new();

    for (name, record_type, target, ttl, id) in records {
        let i = *positions.entry((dns_name(&name), record_type)).or_insert_with(|| {
            endpoints.push(Endpoint::new(name, record_type, Vec::new()).with_ttl(ttl));
            endpoints.len() - 1
        });
        let endpoint = &mut endpoints[i];
        endpoint.provider_specific.insert(format!("{}{}", RECORD_ID_PREFIX, target), id);
        endpoint.targets.push(target);
    }

    endpoints
}

fn collect_ids(e: &Endpoint, ids: &mut RecordIds) {
    for (key, id) in &e.provider_specific {
        if let Some(target) = key.strip_prefix(RECORD_ID_PREFIX) {
            ids.insert(id_key(e, target), id.clone());
        }
    }
}

fn id_key(e: &Endpoint, target: &str) -> (String, RecordType, String) {
    (dns_name(&e.dns_name), e.record_type, target_key(e.record_type, target))
}

/// Targets as Cloudflare stores them.
fn targets(e: &Endpoint) -> Vec<String> {
    e.targets.iter().map(|t| target_key(e.record_type, t)).collect()
}

fn target_key(record_type: RecordType, target: &str) -> String {
    match record_type {
        RecordType::Cname => trim_dot(target).to_owned(),
        _ => target.to_owned(),
    }
}

/// Cloudflare reports names without the trailing dot.
fn dns_name(name: &str) -> String {
    trim_dot(name).to_ascii_lowercase()
}

fn trim_dot(name: &str) -> &str {
    name.trim_end_matches('.')
}

#[derive(Debug, Error)]
pub enum CloudflareError {
    #[error(transparent)]
    NewClientError(#[from] reqwest::Error),
    #[error("failed to build client: {0}")]
    Client(String),
    #[error(transparent)]
    ApiError(#[from] ApiFailure),
    #[error("record not found: {0}")]
    RecordNotFound(String),
    #[error("target {0:?} is not valid for its record type")]
    BadTarget(String),
    #[error("{applied} of {total} record changes applied before failure: {source}")]
    PartiallyApplied {
        applied: usize,
        total: usize,
        #[source]
        source: Box<CloudflareError>,
    },
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl ProviderError for CloudflareError {
    fn partially_applied(&self) -> bool {
        matches!(self, CloudflareError::PartiallyApplied { .. })
    }
}
