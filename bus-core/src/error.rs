// bus-core/src/error.rs

use std::time::Duration;
use thiserror::Error;

/// Boxed error type accepted from observers and external sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum BusError {

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Transport init error: {message}")]
    TransportInit {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Remote call to '{node}' failed: {message}")]
    RemoteCall {
        node: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Remote call to '{node}' timed out after {timeout:?}")]
    TimedOut {
        node: String,
        timeout: Duration,
    },

    #[error("Observer '{observer}' failed: {message}")]
    Observer {
        observer: String,
        message: String,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, BusError>;

// Convenience constructors
impl BusError {

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn transport_init(message: impl Into<String>) -> Self {
        Self::TransportInit {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_init_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::TransportInit {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn remote_call(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteCall {
            node: node.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn remote_call_with_source(
        node: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::RemoteCall {
            node: node.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn timed_out(node: impl Into<String>, timeout: Duration) -> Self {
        Self::TimedOut {
            node: node.into(),
            timeout,
        }
    }

    pub fn observer(observer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Observer {
            observer: observer.into(),
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// True for any failed send, including the timeout specialization.
    pub fn is_remote_call(&self) -> bool {
        matches!(self, Self::RemoteCall { .. } | Self::TimedOut { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timed_out_is_remote_call() {
        let err = BusError::timed_out("worker3", Duration::from_secs(5));
        assert!(err.is_remote_call());

        let err = BusError::remote_call("worker3", "connection refused");
        assert!(err.is_remote_call());

        let err = BusError::config("bad rank");
        assert!(!err.is_remote_call());
    }

    #[test]
    fn test_error_display() {
        let err = BusError::remote_call("worker1", "peer unreachable");
        assert!(err.to_string().contains("worker1"));
        assert!(err.to_string().contains("peer unreachable"));
    }
}
