//! Warnings the backend emits for conditions operators need to act on.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

mod common;

use std::sync::{Arc, Mutex};

use common::{dn, load, loaded_backend, matching, memory_backend_with};
use dirstore_backend::{Backend, IndexSelector};
use dirstore_test_utils::fixtures;
use dirstore_types::{
    Modification,
    config::{IndexConfig, IndexKind},
};
use tracing_subscriber::layer::SubscriberExt;

/// Records the message of every WARN event.
struct WarningLayer {
    messages: Arc<Mutex<Vec<String>>>,
}

struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.0 = format!("{value:?}");
        }
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarningLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::WARN {
            let mut message = String::new();
            event.record(&mut MessageVisitor(&mut message));
            self.messages.lock().unwrap().push(message);
        }
    }
}

fn warnings_during<F, R>(f: F) -> (R, Vec<String>)
where
    F: FnOnce() -> R,
{
    let messages = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::registry().with(WarningLayer { messages: messages.clone() });
    let result = tracing::subscriber::with_default(subscriber, f);
    let messages = messages.lock().unwrap().clone();
    (result, messages)
}

#[test]
fn test_unindexed_search_warns() {
    let backend = loaded_backend(3);

    let (found, warnings) = warnings_during(|| matching(&backend, "(description=*)"));
    assert!(found.is_empty());
    assert!(warnings.iter().any(|w| w.contains("unindexed search")), "{warnings:?}");

    let (_, warnings) = warnings_during(|| matching(&backend, "(uid=user1)"));
    assert!(warnings.is_empty(), "{warnings:?}");
}

#[test]
fn test_untrusted_index_warns_until_rebuilt() {
    let mut without_mail = fixtures::standard_config();
    without_mail.indexes.retain(|i| i.attribute != "mail");
    let backend = memory_backend_with(without_mail);
    load(&backend, 2);
    let substrate = Arc::clone(backend.substrate());
    drop(backend);

    let (backend, warnings) =
        warnings_during(|| Backend::open(fixtures::standard_config(), substrate).unwrap());
    assert!(warnings.iter().any(|w| w.contains("not trusted")), "{warnings:?}");

    let (_, warnings) = warnings_during(|| matching(&backend, "(mail=user1@example.com)"));
    assert!(warnings.iter().any(|w| w.contains("untrusted")), "{warnings:?}");

    backend.rebuild_index(&IndexSelector::parse("mail"), None).unwrap();
    let (_, warnings) = warnings_during(|| matching(&backend, "(mail=user1@example.com)"));
    assert!(warnings.is_empty(), "{warnings:?}");
}

#[test]
fn test_exceeding_an_entry_limit_warns() {
    let mut config = fixtures::standard_config();
    config.indexes.push(
        IndexConfig::builder()
            .attribute("roomNumber".to_string())
            .kinds(vec![IndexKind::Equality])
            .entry_limit(2)
            .build()
            .unwrap(),
    );
    let backend = memory_backend_with(config);
    load(&backend, 3);
    let room = |i: usize| {
        let target = dn(&format!("uid=user{i},ou=people,dc=example,dc=com"));
        backend.modify(&target, vec![Modification::add("roomNumber", &["101"])], None).unwrap();
    };

    let (_, warnings) = warnings_during(|| {
        room(0);
        room(1);
    });
    assert!(warnings.is_empty(), "{warnings:?}");

    let (_, warnings) = warnings_during(|| room(2));
    assert!(warnings.iter().any(|w| w.contains("entry limit")), "{warnings:?}");
}
