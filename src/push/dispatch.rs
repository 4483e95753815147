//! Translation of push events into cache invalidations and writes.

use serde_json::Value;
use tracing::{debug, warn};

use super::event::ChannelEvent;
use crate::cache::{CacheKey, QueryCache};
use crate::compliance::Domain;

/// What an event kind does to its own domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effect {
  /// A new entity exists; only lists change.
  Listed,
  /// An existing entity changed; its detail and every list change.
  Changed,
  Heartbeat,
}

struct Route {
  kind: &'static str,
  effect: Effect,
  /// Other domains whose cached views embed this entity.
  related: &'static [Domain],
}

const ROUTES: &[Route] = &[
  Route {
    kind: "applicant.created",
    effect: Effect::Listed,
    related: &[],
  },
  Route {
    kind: "applicant.updated",
    effect: Effect::Changed,
    related: &[],
  },
  Route {
    kind: "applicant.reviewed",
    effect: Effect::Changed,
    related: &[Domain::Cases],
  },
  Route {
    kind: "case.created",
    effect: Effect::Listed,
    related: &[],
  },
  Route {
    kind: "case.updated",
    effect: Effect::Changed,
    related: &[],
  },
  Route {
    kind: "case.resolved",
    effect: Effect::Changed,
    related: &[Domain::Applicants],
  },
  Route {
    kind: "document.created",
    effect: Effect::Listed,
    related: &[],
  },
  Route {
    kind: "document.completed",
    effect: Effect::Changed,
    related: &[],
  },
  Route {
    kind: "screening.completed",
    effect: Effect::Changed,
    related: &[Domain::Applicants],
  },
  Route {
    kind: "job.completed",
    effect: Effect::Changed,
    related: &[],
  },
  Route {
    kind: "ping",
    effect: Effect::Heartbeat,
    related: &[],
  },
];

/// A single change to apply to the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheAction {
  Invalidate(CacheKey),
  Write(CacheKey, Value),
}

/// How an event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
  Applied,
  Heartbeat,
  Ignored,
}

/// The cache actions for `event`, or `None` if its type is not routed.
pub fn plan(event: &ChannelEvent) -> Option<Vec<CacheAction>> {
  let route = ROUTES.iter().find(|r| r.kind == event.kind)?;
  if route.effect == Effect::Heartbeat {
    return Some(Vec::new());
  }
  let domain = event
    .topic()
    .and_then(|(prefix, _)| Domain::from_event_prefix(prefix))?;

  let mut actions = Vec::new();
  if route.effect == Effect::Changed {
    match (&event.entity_id, event.object_payload()) {
      (Some(id), Some(payload)) => {
        actions.push(CacheAction::Write(domain.detail(id), payload.clone()))
      }
      (Some(id), None) => actions.push(CacheAction::Invalidate(domain.detail(id))),
      // Without an id every detail of the domain is suspect.
      (None, _) => actions.push(CacheAction::Invalidate(domain.scope())),
    }
  }
  actions.push(CacheAction::Invalidate(domain.lists()));
  actions.extend(
    route
      .related
      .iter()
      .map(|related| CacheAction::Invalidate(related.scope())),
  );
  Some(actions)
}

/// Apply `event` to `cache`. Writes land first, then one invalidation pass.
pub fn dispatch(cache: &QueryCache, event: &ChannelEvent) -> Dispatch {
  let Some(actions) = plan(event) else {
    warn!(kind = %event.kind, "ignoring event of unknown type");
    return Dispatch::Ignored;
  };
  if actions.is_empty() {
    return Dispatch::Heartbeat;
  }

  let mut scopes = Vec::new();
  for action in actions {
    match action {
      CacheAction::Write(key, data) => cache.write_value(&key, data),
      CacheAction::Invalidate(scope) => scopes.push(scope),
    }
  }
  let matched = cache.invalidate_many(&scopes);
  debug!(kind = %event.kind, entity = ?event.entity_id, matched, "event dispatched");
  Dispatch::Applied
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn event(kind: &str, entity_id: Option<&str>, payload: Option<Value>) -> ChannelEvent {
    ChannelEvent {
      kind: kind.to_string(),
      entity_id: entity_id.map(String::from),
      payload,
    }
  }

  #[test]
  fn test_routes_cover_every_domain() {
    for domain in Domain::ALL {
      let prefix = domain.name().trim_end_matches('s');
      assert!(
        ROUTES.iter().any(|r| r.kind.starts_with(prefix)),
        "no route for {}",
        domain
      );
    }
  }

  #[test]
  fn test_update_with_payload_writes_detail() {
    let payload = json!({"id": "42", "status": "approved"});
    let actions = plan(&event("applicant.updated", Some("42"), Some(payload.clone()))).unwrap();
    assert_eq!(
      actions,
      vec![
        CacheAction::Write(Domain::Applicants.detail("42"), payload),
        CacheAction::Invalidate(Domain::Applicants.lists()),
      ]
    );
  }

  #[test]
  fn test_update_without_payload_invalidates_detail() {
    let actions = plan(&event("case.resolved", Some("c-1"), None)).unwrap();
    assert_eq!(
      actions,
      vec![
        CacheAction::Invalidate(Domain::Cases.detail("c-1")),
        CacheAction::Invalidate(Domain::Cases.lists()),
        CacheAction::Invalidate(Domain::Applicants.scope()),
      ]
    );
  }

  #[test]
  fn test_created_only_touches_lists() {
    let actions = plan(&event("document.created", Some("d-1"), Some(json!({})))).unwrap();
    assert_eq!(actions, vec![CacheAction::Invalidate(Domain::Documents.lists())]);
  }

  #[test]
  fn test_ping_and_unknown_types() {
    assert_eq!(plan(&event("ping", None, None)), Some(Vec::new()));
    assert_eq!(plan(&event("invoice.paid", Some("1"), None)), None);
    assert_eq!(plan(&event("applicant.deleted", Some("1"), None)), None);
  }

  #[tokio::test]
  async fn test_dispatch_applies_to_cache() {
    let cache = QueryCache::new();
    let list = Domain::Applicants.lists().push(0i64);
    cache.write_value(&list, json!({"items": [], "total": 0}));
    cache.write_value(&Domain::Cases.detail("c-1"), json!({"id": "c-1"}));

    let payload = json!({"id": "42", "status": "approved"});
    let handled = dispatch(
      &cache,
      &event("applicant.reviewed", Some("42"), Some(payload.clone())),
    );

    assert_eq!(handled, Dispatch::Applied);
    assert_eq!(cache.read(&Domain::Applicants.detail("42")).data, Some(payload));
    assert!(cache.read(&list).invalidated);
    assert!(cache.read(&Domain::Cases.detail("c-1")).invalidated);
  }

  #[tokio::test]
  async fn test_unknown_event_leaves_cache_alone() {
    let cache = QueryCache::new();
    let list = Domain::Applicants.lists();
    cache.write_value(&list, json!([]));

    assert_eq!(dispatch(&cache, &event("audit.logged", None, None)), Dispatch::Ignored);
    assert_eq!(dispatch(&cache, &event("ping", None, None)), Dispatch::Heartbeat);
    assert!(!cache.read(&list).invalidated);
  }
}
