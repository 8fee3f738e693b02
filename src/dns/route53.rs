use aws_config::SdkConfig;
use aws_sdk_route53::Client;
use aws_sdk_route53::operation::change_resource_record_sets::ChangeResourceRecordSetsError;
use aws_sdk_route53::operation::list_resource_record_sets::ListResourceRecordSetsError;
use aws_sdk_route53::types::{Change, ChangeAction, ChangeBatch, ResourceRecord, ResourceRecordSet, RrType};
use aws_smithy_http::result::SdkError;
use thiserror::Error;
use tracing::{debug, info};
use crate::{
    context::{Cancelled, Context},
    endpoint::{Endpoint, RecordType},
    plan::Changes,
};
use super::{ensure_trailing_dot, Provider, ProviderError};

const DEFAULT_TTL: i64 = 300;

/// Route53 hosted zone backend.
///
/// All changes of one `apply_changes` call are sent as a single change
/// batch, which Route53 applies atomically: on error nothing was applied.
#[derive(Debug, Clone)]
pub struct Route53Provider {
    hosted_zone_id: String,
    client: Client,

    ttl: i64,
}

impl Route53Provider {
    pub fn new(config: &SdkConfig, hosted_zone_id: String) -> Self {
        Self {
            hosted_zone_id,
            client: Client::new(config),
            ttl: DEFAULT_TTL,
        }
    }

    pub fn ttl_mut(&mut self) -> &mut i64 {
        &mut self.ttl
    }

    async fn list_all(&self) -> Result<Vec<Endpoint>, Route53Error> {
        let mut endpoints = Vec::new();
        let mut start: Option<(String, RrType)> = None;

        loop {
            let (name, rr_type) = start.take().unzip();
            let page = self.client.list_resource_record_sets()
                .hosted_zone_id(self.hosted_zone_id.clone())
                .set_start_record_name(name)
                .set_start_record_type(rr_type)
                .send()
                .await?;

            endpoints.extend(page.resource_record_sets()
                .unwrap_or_default()
                .iter()
                .filter_map(endpoint_from_record_set));

            if !page.is_truncated() {
                break;
            }
            match (page.next_record_name(), page.next_record_type()) {
                (Some(name), Some(rr_type)) => start = Some((name.to_owned(), rr_type.clone())),
                _ => break,
            }
        }

        debug!("got {} record sets from Route53", endpoints.len());
        Ok(endpoints)
    }
}

#[async_trait::async_trait]
impl Provider for Route53Provider {
    type Error = Route53Error;

    #[tracing::instrument(skip_all, fields(zone = %self.hosted_zone_id))]
    async fn records(&self, ctx: &Context) -> Result<Vec<Endpoint>, Self::Error> {
        ctx.run(self.list_all()).await?
    }

    #[tracing::instrument(skip_all, fields(zone = %self.hosted_zone_id))]
    async fn apply_changes(
        &self,
        ctx: &Context,
        changes: &Changes,
        cached: Option<&[Endpoint]>,
    ) -> Result<(), Self::Error> {
        if changes.is_empty() {
            return Ok(());
        }

        // Deletes must match the existing record set exactly, TTL included.
        let fetched;
        let known: &[Endpoint] = match cached {
            Some(records) => records,
            None if changes.delete.iter().any(|e| e.ttl.is_none()) => {
                fetched = ctx.run(self.list_all()).await??;
                &fetched
            }
            None => &[],
        };
        let batch = change_batch(changes, known, self.ttl);
        info!("submitting change batch of {} changes", batch.len());

        let request = self.client.change_resource_record_sets()
            .hosted_zone_id(self.hosted_zone_id.clone())
            .change_batch(ChangeBatch::builder()
                .set_changes(Some(batch))
                .build())
            .send();
        ctx.run(request).await??;

        Ok(())
    }
}

fn rr_type(record_type: RecordType) -> RrType {
    match record_type {
        RecordType::A => RrType::A,
        RecordType::Aaaa => RrType::Aaaa,
        RecordType::Cname => RrType::Cname,
        RecordType::Txt => RrType::Txt,
    }
}

/// Builds the change batch for `changes`.
///
/// Deletes without a TTL take it from the matching record set in `known`.
fn change_batch(changes: &Changes, known: &[Endpoint], default_ttl: i64) -> Vec<Change> {
    let known_ttl = |e: &Endpoint| {
        let key = e.key();
        known.iter()
            .find(|k| k.key() == key)
            .and_then(|k| k.ttl)
            .map(i64::from)
    };

    let mut batch = Vec::with_capacity(changes.create.len() + changes.update_new.len() + changes.delete.len());
    for e in &changes.create {
        batch.push(change(ChangeAction::Create, e, e.ttl.map_or(default_ttl, i64::from)));
    }
    for (old, new) in changes.updates() {
        let ttl = new.ttl.or(old.ttl).map_or(default_ttl, i64::from);
        batch.push(change(ChangeAction::Upsert, new, ttl));
    }
    for e in &changes.delete {
        let ttl = e.ttl.map(i64::from).or_else(|| known_ttl(e)).unwrap_or(default_ttl);
        batch.push(change(ChangeAction::Delete, e, ttl));
    }
    batch
}

fn change(action: ChangeAction, e: &Endpoint, ttl: i64) -> Change {
    Change::builder()
        .action(action)
        .resource_record_set(ResourceRecordSet::builder()
            .name(ensure_trailing_dot(&e.dns_name))
            .r#type(rr_type(e.record_type))
            .set_resource_records(Some(e.targets.iter()
                .map(|t| ResourceRecord::builder().value(record_value(e.record_type, t)).build())
                .collect()))
            .ttl(ttl)
            .build())
        .build()
}

/// Route53 wants TXT values as quoted character strings.
fn record_value(record_type: RecordType, target: &str) -> String {
    if record_type != RecordType::Txt || is_quoted(target) {
        return target.to_owned();
    }
    let mut quoted = String::with_capacity(target.len() + 2);
    quoted.push('"');
    for c in target.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Inverse of [`record_value`] for a single character string. Values made of
/// several strings are kept as Route53 returns them.
fn target_from_value(record_type: RecordType, value: &str) -> String {
    if record_type != RecordType::Txt || !is_quoted(value) {
        return value.to_owned();
    }
    let inner = &value[1..value.len() - 1];
    let mut target = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => return value.to_owned(),
            '\\' => target.extend(chars.next()),
            c => target.push(c),
        }
    }
    target
}

fn is_quoted(value: &str) -> bool {
    value.len() >= 2 && value.starts_with('"') && value.ends_with('"')
}

/// Converts a plain record set. Alias records and unsupported types are skipped.
fn endpoint_from_record_set(r: &ResourceRecordSet) -> Option<Endpoint> {
    let record_type = match r.r#type()? {
        RrType::A => RecordType::A,
        RrType::Aaaa => RecordType::Aaaa,
        RrType::Cname => RecordType::Cname,
        RrType::Txt => RecordType::Txt,
        _ => return None,
    };
    let targets: Vec<String> = r.resource_records()
        .unwrap_or_default()
        .iter()
        .filter_map(|v| v.value().map(|v| target_from_value(record_type, v)))
        .collect();
    if targets.is_empty() {
        return None;
    }

    let mut endpoint = Endpoint::new(r.name()?, record_type, targets);
    endpoint.ttl = r.ttl().and_then(|t| u32::try_from(t).ok());
    Some(endpoint)
}

#[derive(Debug, Error)]
pub enum Route53Error {
    #[error(transparent)]
    ChangeSetsError(#[from] SdkError<ChangeResourceRecordSetsError>),
    #[error(transparent)]
    ListSetsError(#[from] SdkError<ListResourceRecordSetsError>),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl ProviderError for Route53Error {}

#[cfg(test)]
mod tests {
    use aws_sdk_route53::types::AliasTarget;
    use super::*;

    fn cname_set(name: &str, value: &str, ttl: i64) -> ResourceRecordSet {
        ResourceRecordSet::builder()
            .name(name)
            .r#type(RrType::Cname)
            .ttl(ttl)
            .resource_records(ResourceRecord::builder().value(value).build())
            .build()
    }

    #[test]
    fn converts_cname_record_set() {
        let e = endpoint_from_record_set(&cname_set("app.example.com.", "lb.example.com", 60)).unwrap();

        assert_eq!(e.dns_name, "app.example.com.");
        assert_eq!(e.record_type, RecordType::Cname);
        assert_eq!(e.targets, vec!["lb.example.com"]);
        assert_eq!(e.ttl, Some(60));
    }

    #[test]
    fn skips_alias_and_unsupported_sets() {
        let alias = ResourceRecordSet::builder()
            .name("apex.example.com.")
            .r#type(RrType::A)
            .alias_target(AliasTarget::builder()
                .dns_name("lb-123.elb.amazonaws.com.")
                .hosted_zone_id("Z35SXDOTRQ7X7K")
                .evaluate_target_health(false)
                .build())
            .build();
        assert!(endpoint_from_record_set(&alias).is_none());

        let ns = ResourceRecordSet::builder()
            .name("example.com.")
            .r#type(RrType::Ns)
            .resource_records(ResourceRecord::builder().value("ns-1.awsdns-00.com.").build())
            .build();
        assert!(endpoint_from_record_set(&ns).is_none());
    }

    #[test]
    fn change_uses_fqdn_and_all_targets() {
        let e = Endpoint::new("www.example.com", RecordType::A, vec!["10.0.0.1".into(), "10.0.0.2".into()]);
        let c = change(ChangeAction::Delete, &e, 120);

        assert_eq!(c.action(), Some(&ChangeAction::Delete));
        let set = c.resource_record_set().unwrap();
        assert_eq!(set.name(), Some("www.example.com."));
        assert_eq!(set.r#type(), Some(&RrType::A));
        assert_eq!(set.ttl(), Some(120));
        let values: Vec<_> = set.resource_records()
            .unwrap_or_default()
            .iter()
            .filter_map(|r| r.value())
            .collect();
        assert_eq!(values, vec!["10.0.0.1", "10.0.0.2"]);
    }

    fn summary(batch: &[Change]) -> Vec<(ChangeAction, String, i64)> {
        batch.iter()
            .map(|c| {
                let set = c.resource_record_set().unwrap();
                (c.action().unwrap().clone(), set.name().unwrap().to_owned(), set.ttl().unwrap())
            })
            .collect()
    }

    fn cname(name: &str, target: &str) -> Endpoint {
        Endpoint::new(name, RecordType::Cname, vec![target.to_owned()])
    }

    #[test]
    fn batch_covers_create_upsert_and_delete() {
        let changes = Changes {
            create: vec![cname("new.example.com", "lb.example.com").with_ttl(60)],
            update_old: vec![cname("moved.example.com.", "old.example.com.").with_ttl(600)],
            update_new: vec![cname("moved.example.com.", "lb.example.com.")],
            delete: vec![cname("gone.example.com.", "lb.example.com.").with_ttl(30)],
        };

        let batch = change_batch(&changes, &[], 300);

        assert_eq!(summary(&batch), vec![
            (ChangeAction::Create, "new.example.com.".to_owned(), 60),
            (ChangeAction::Upsert, "moved.example.com.".to_owned(), 600),
            (ChangeAction::Delete, "gone.example.com.".to_owned(), 30),
        ]);
    }

    #[test]
    fn ttl_only_update_is_an_upsert() {
        let changes = Changes {
            update_old: vec![cname("app.example.com.", "lb.example.com.").with_ttl(300)],
            update_new: vec![cname("app.example.com.", "lb.example.com.").with_ttl(120)],
            ..Changes::default()
        };

        let batch = change_batch(&changes, &[], 300);

        assert_eq!(summary(&batch), vec![(ChangeAction::Upsert, "app.example.com.".to_owned(), 120)]);
    }

    #[test]
    fn delete_ttl_comes_from_known_records() {
        let changes = Changes {
            delete: vec![cname("gone.example.com", "lb.example.com.")],
            ..Changes::default()
        };
        let known = vec![
            cname("other.example.com.", "lb.example.com.").with_ttl(60),
            cname("gone.example.com.", "lb.example.com.").with_ttl(3600),
        ];

        assert_eq!(summary(&change_batch(&changes, &known, 300)), vec![
            (ChangeAction::Delete, "gone.example.com.".to_owned(), 3600),
        ]);
        assert_eq!(summary(&change_batch(&changes, &[], 300)), vec![
            (ChangeAction::Delete, "gone.example.com.".to_owned(), 300),
        ]);
    }

    #[test]
    fn txt_values_are_quoted_on_write() {
        let e = Endpoint::new("_acme.example.com", RecordType::Txt, vec![
            "token".into(),
            r#"say "hi""#.into(),
            r#""already quoted""#.into(),
        ]);
        let c = change(ChangeAction::Create, &e, 60);

        let values: Vec<_> = c.resource_record_set()
            .unwrap()
            .resource_records()
            .unwrap_or_default()
            .iter()
            .filter_map(|r| r.value())
            .collect();
        assert_eq!(values, vec![r#""token""#, r#""say \"hi\"""#, r#""already quoted""#]);
    }

    #[test]
    fn txt_values_are_unquoted_on_read() {
        let set = ResourceRecordSet::builder()
            .name("_acme.example.com.")
            .r#type(RrType::Txt)
            .ttl(60)
            .resource_records(ResourceRecord::builder().value(r#""token""#).build())
            .resource_records(ResourceRecord::builder().value(r#""say \"hi\"""#).build())
            .resource_records(ResourceRecord::builder().value(r#""part one" "part two""#).build())
            .build();

        let e = endpoint_from_record_set(&set).unwrap();
        assert_eq!(e.targets, vec!["token", r#"say "hi""#, r#""part one" "part two""#]);
    }

    #[test]
    fn non_txt_values_are_untouched() {
        assert_eq!(record_value(RecordType::Cname, "lb.example.com."), "lb.example.com.");
        assert_eq!(target_from_value(RecordType::A, "\"10.0.0.1\""), "\"10.0.0.1\"");
    }
}
