//! Operator-facing sinks for poll results.
//!
//! Reporting is fire-and-forget: a sink never returns errors to the poll
//! engine, it logs them and moves on.

use log::*;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A one-way sink for decoded values and failure messages.
pub trait Reporter: Send + Sync {
    fn notify_value(&self, server: &str, register: &str, value: f64, unit: &str);

    fn notify_error(&self, message: &str);
}

impl<R: Reporter + ?Sized> Reporter for Arc<R> {
    fn notify_value(&self, server: &str, register: &str, value: f64, unit: &str) {
        (**self).notify_value(server, register, value, unit)
    }

    fn notify_error(&self, message: &str) {
        (**self).notify_error(message)
    }
}

impl<R: Reporter + ?Sized> Reporter for Box<R> {
    fn notify_value(&self, server: &str, register: &str, value: f64, unit: &str) {
        (**self).notify_value(server, register, value, unit)
    }

    fn notify_error(&self, message: &str) {
        (**self).notify_error(message)
    }
}

/// Formats a value line the way it is printed on the console.
pub fn format_value(server: &str, register: &str, value: f64, unit: &str) -> String {
    if unit.is_empty() {
        format!("{server}; {register}: {value}")
    } else {
        format!("{server}; {register}: {value} {unit}")
    }
}

/// Prints every value and failure as one line to the standard output,
/// or to any other writer.
///
/// Write errors such as a closed pipe are logged once and otherwise ignored.
#[derive(Debug)]
pub struct ConsoleReporter<W = io::Stdout> {
    out: Mutex<W>,
    broken: AtomicBool,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self::with_writer(io::stdout())
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Send> ConsoleReporter<W> {
    pub fn with_writer(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            broken: AtomicBool::new(false),
        }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_line(&self, line: &str) {
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = writeln!(out, "{line}").and_then(|()| out.flush()) {
            if self.broken.swap(true, Ordering::Relaxed) {
                trace!("Cannot write to console: {err}");
            } else {
                warn!("Cannot write to console, further write errors are only traced: {err}");
            }
        }
    }
}

impl<W: Write + Send> Reporter for ConsoleReporter<W> {
    fn notify_value(&self, server: &str, register: &str, value: f64, unit: &str) {
        self.write_line(&format_value(server, register, value, unit));
    }

    fn notify_error(&self, message: &str) {
        self.write_line(&format!("Error: {message}"));
    }
}

/// Forwards every notification to several sinks.
#[derive(Default)]
pub struct Reporters {
    sinks: Vec<Box<dyn Reporter>>,
}

impl Reporters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl Reporter + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Reporter for Reporters {
    fn notify_value(&self, server: &str, register: &str, value: f64, unit: &str) {
        for sink in &self.sinks {
            sink.notify_value(server, register, value, unit);
        }
    }

    fn notify_error(&self, message: &str) {
        for sink in &self.sinks {
            sink.notify_error(message);
        }
    }
}

#[cfg(feature = "mqtt")]
pub use self::mqtt::MqttReporter;

#[cfg(feature = "mqtt")]
mod mqtt {
    use super::Reporter;
    use crate::config::MqttConfig;
    use log::*;
    use paho_mqtt as mqtt;
    use std::time::Duration;

    const APPENDIX_AVAILABILITY: &str = "availability";
    const APPENDIX_ERROR: &str = "error";

    /// Builds the messages published below a topic prefix.
    #[derive(Debug, Clone, PartialEq)]
    struct Topics {
        prefix: String,
        qos: i32,
    }

    impl Topics {
        fn topic(&self, appendix: &str) -> String {
            format!("{}/{}", self.prefix, appendix)
        }

        fn value_message(&self, server: &str, register: &str, value: f64) -> mqtt::Message {
            mqtt::Message::new(
                self.topic(&format!("{server}/{register}")),
                value.to_string(),
                self.qos,
            )
        }

        fn error_message(&self, message: &str) -> mqtt::Message {
            mqtt::Message::new(self.topic(APPENDIX_ERROR), message, self.qos)
        }

        fn availability_message(&self, state: &str) -> mqtt::Message {
            mqtt::Message::new_retained(self.topic(APPENDIX_AVAILABILITY), state, self.qos)
        }
    }

    /// Publishes values to `<prefix>/<server>/<register>` on an MQTT broker.
    pub struct MqttReporter {
        client: mqtt::AsyncClient,
        topics: Topics,
    }

    impl MqttReporter {
        /// Connects to the broker and announces the collector as online.
        pub async fn connect(config: &MqttConfig) -> crate::Result<Self> {
            let create_options = mqtt::CreateOptionsBuilder::new()
                .server_uri(config.url.as_str())
                .client_id(config.client_id.as_str())
                .finalize();
            let client = mqtt::AsyncClient::new(create_options)?;
            let topics = Topics {
                prefix: config.topic_prefix.clone(),
                qos: config.qos(),
            };

            let mut conn_builder = mqtt::ConnectOptionsBuilder::new();
            conn_builder
                .keep_alive_interval(Duration::from_secs(20))
                .clean_session(true)
                .will_message(topics.availability_message("offline"));
            if let Some(user_name) = &config.username {
                conn_builder.user_name(user_name.as_str());
            }
            if let Some(password) = &config.password {
                conn_builder.password(password.as_str());
            }
            client.connect(conn_builder.finalize()).await?;
            info!("Connected to MQTT broker {}", config.url);

            client.publish(topics.availability_message("online")).await?;
            Ok(Self { client, topics })
        }

        fn publish(&self, message: mqtt::Message) {
            let topic = message.topic().to_string();
            let token = self.client.publish(message);
            // Delivery is only awaited to log failures.
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(err) = token.await {
                            warn!("Cannot publish MQTT message to {topic}: {err}");
                        }
                    });
                }
                Err(_) => trace!("No runtime to track delivery to {topic}"),
            }
        }

        /// Announces the collector as offline and disconnects.
        pub async fn disconnect(&self) -> crate::Result<()> {
            self.client
                .publish(self.topics.availability_message("offline"))
                .await?;
            self.client.disconnect(None).await?;
            Ok(())
        }
    }

    impl Reporter for MqttReporter {
        fn notify_value(&self, server: &str, register: &str, value: f64, _unit: &str) {
            self.publish(self.topics.value_message(server, register, value));
        }

        fn notify_error(&self, message: &str) {
            self.publish(self.topics.error_message(message));
        }
    }

}
