//! Unit tests for the FastDFS client
//!
//! This test module verifies the client's behavior including configuration
//! validation, lifecycle management, and error handling for edge cases that
//! do not need a running cluster.

use fastdfs::{Client, ClientConfig, FastDFSError};

/// Test suite for client configuration
#[cfg(test)]
mod config_tests {
    use super::*;

    /// Test creating client with valid configuration
    #[test]
    fn test_client_creation_valid_config() {
        let config = ClientConfig::new(vec!["127.0.0.1:22122".to_string()]);
        assert!(Client::new(config).is_ok());
    }

    /// Test creating client with empty tracker addresses
    #[test]
    fn test_client_creation_empty_trackers() {
        let config = ClientConfig::new(vec![]);
        assert!(
            Client::new(config).is_err(),
            "client creation should fail with no tracker addresses"
        );
    }

    /// Test creating client with invalid tracker address format
    #[test]
    fn test_client_creation_invalid_address() {
        let config = ClientConfig::new(vec!["invalid".to_string()]);
        assert!(
            Client::new(config).is_err(),
            "tracker addresses must be host:port"
        );
    }

    /// Test configuration builder pattern
    ///
    /// Verifies that the builder methods set custom values for every option.
    #[test]
    fn test_config_builder() {
        let config = ClientConfig::new(vec!["127.0.0.1:22122".to_string()])
            .with_max_conns(20)
            .with_connect_timeout(3000)
            .with_network_timeout(15000)
            .with_idle_timeout(30000)
            .with_retry_count(5);

        assert_eq!(config.max_conns, 20);
        assert_eq!(config.connect_timeout, 3000);
        assert_eq!(config.network_timeout, 15000);
        assert_eq!(config.idle_timeout, 30000);
        assert_eq!(config.retry_count, 5);
    }

    /// Test configuration defaults
    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::new(vec!["127.0.0.1:22122".to_string()]);
        assert_eq!(config.max_conns, 10);
        assert_eq!(config.connect_timeout, 5000);
        assert_eq!(config.network_timeout, 30000);
        assert_eq!(config.retry_count, 3);
    }
}

/// Test suite for client lifecycle
#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    /// Test that operations on a closed client fail with ClientClosed
    #[tokio::test]
    async fn test_operations_after_close() {
        let config = ClientConfig::new(vec!["127.0.0.1:22122".to_string()]);
        let client = Client::new(config).unwrap();
        client.close().await;

        let err = client.download_file("group1/M00/00/00/x.txt").await.unwrap_err();
        assert!(matches!(err, FastDFSError::ClientClosed));

        let err = client.upload_buffer(b"data", "txt", None).await.unwrap_err();
        assert!(matches!(err, FastDFSError::ClientClosed));
    }

    /// Test that close is idempotent
    #[tokio::test]
    async fn test_double_close() {
        let config = ClientConfig::new(vec!["127.0.0.1:22122".to_string()]);
        let client = Client::new(config).unwrap();
        client.close().await;
        client.close().await;
    }

    /// Test that file_exists is false on a closed client rather than an error
    #[tokio::test]
    async fn test_file_exists_after_close() {
        let config = ClientConfig::new(vec!["127.0.0.1:22122".to_string()]);
        let client = Client::new(config).unwrap();
        client.close().await;
        assert!(!client.file_exists("group1/M00/00/00/x.txt").await);
    }
}

/// Test suite for file ID validation at the client edge
#[cfg(test)]
mod file_id_tests {
    use super::*;

    /// Test that malformed file IDs are rejected before any network I/O
    #[tokio::test]
    async fn test_malformed_file_id_rejected_locally() {
        let config = ClientConfig::new(vec!["127.0.0.1:22122".to_string()]);
        let client = Client::new(config).unwrap();

        for bad in ["", "noslash", "/nogroup", "group1/"] {
            let err = client.download_file(bad).await.unwrap_err();
            assert!(
                matches!(err, FastDFSError::InvalidFileId(_)),
                "{:?} should be rejected as a file id",
                bad
            );
        }
        client.close().await;
    }
}
