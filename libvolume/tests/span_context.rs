//! Engine transition spans carry the remote and volume they act on.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

use libvolume::backend::MemoryBackend;
use libvolume::{EngineConfig, ReconcileEngine, VolumeIdentity, VolumeSpec};

/// Records `(span name, field, value)` for the `remote` and `volume` fields
/// of every new span.
#[derive(Clone, Default)]
struct SpanFields(Arc<Mutex<Vec<(String, String, String)>>>);

struct Recorder<'a> {
    span: &'static str,
    out: &'a mut Vec<(String, String, String)>,
}

impl Visit for Recorder<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if matches!(field.name(), "remote" | "volume") {
            self.out.push((
                self.span.to_owned(),
                field.name().to_owned(),
                format!("{value:?}"),
            ));
        }
    }
}

impl<S: Subscriber> Layer<S> for SpanFields {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        let mut out = self.0.lock();
        attrs.record(&mut Recorder {
            span: attrs.metadata().name(),
            out: &mut out,
        });
    }
}

#[tokio::test]
async fn transition_spans_record_remote() {
    let fields = SpanFields::default();
    let subscriber = tracing_subscriber::registry().with(fields.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let config = EngineConfig {
        remote: "lab".into(),
        ..EngineConfig::default()
    };
    let engine = ReconcileEngine::new(Arc::new(MemoryBackend::new()), config);
    let id = VolumeIdentity::new("pool1", "vol1");
    engine.create(VolumeSpec::new(id.clone())).await.unwrap();
    engine.delete(&id, false).await.unwrap();

    let recorded = fields.0.lock().clone();
    let has = |span: &str, field: &str, value: &str| {
        recorded
            .iter()
            .any(|(s, f, v)| s == span && f == field && v == value)
    };
    for span in ["create", "delete"] {
        assert!(has(span, "remote", "lab"), "{span}: {recorded:?}");
        assert!(has(span, "volume", "/pool1/vol1"), "{span}: {recorded:?}");
    }
}
