use tokio::sync::broadcast;

/// A tracing layer that forwards WARN and ERROR lines to connected consumers
/// through the log broadcast channel.
pub struct BroadcastLayer {
    sender: broadcast::Sender<String>,
}

impl BroadcastLayer {
    pub fn new(sender: broadcast::Sender<String>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only forward WARN and ERROR to consumers to avoid clogging the channel
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let now = chrono::Local::now();
        let message = format!(
            "{} [{}] {}{}",
            now.format("%H:%M:%S"),
            level,
            visitor.message,
            visitor.fields
        );

        // no receivers is fine
        let _ = self.sender.send(message);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message.push_str(&format!("{:?}", value));
        } else {
            self.fields
                .push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_forwards_only_warnings_and_errors() {
        let (tx, mut rx) = broadcast::channel(8);
        let subscriber = tracing_subscriber::registry().with(BroadcastLayer::new(tx));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("routine");
            tracing::warn!(tab = 4, "dispatch failed");
        });

        let line = rx.try_recv().unwrap();
        assert!(line.contains("[WARN] dispatch failed"));
        assert!(line.contains("tab=4"));
        assert!(rx.try_recv().is_err());
    }
}
