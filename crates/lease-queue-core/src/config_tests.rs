//! Tests for queue and worker configuration.

use super::*;

mod queue_config {
    use super::*;

    /// Verify the documented defaults.
    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();

        assert_eq!(config.max_delivery_attempts, 5);
        assert_eq!(config.base_delay(), Duration::seconds(1));
        assert_eq!(config.max_backoff(), Duration::seconds(60));
        assert_eq!(config.default_lease_duration(), Duration::seconds(30));
        assert_eq!(config.max_dequeue_attempts, 16);
        assert_eq!(config.max_payload_bytes, 65_536);
        assert_eq!(config.reap_interval(), Duration::seconds(1));
        assert_eq!(config.storage, StorageConfig::InMemory);
        assert!(config.validate().is_ok());
    }

    /// Verify that the retry policy mirrors the settings.
    #[test]
    fn test_retry_policy_from_config() {
        let config = QueueConfig {
            max_delivery_attempts: 2,
            base_delay_ms: 250,
            max_backoff_ms: 1_000,
            ..QueueConfig::default()
        };

        let policy = config.retry_policy();

        assert_eq!(policy.max_delivery_attempts, 2);
        assert_eq!(policy.base_delay, Duration::milliseconds(250));
        assert_eq!(policy.max_backoff, Duration::seconds(1));
    }

    /// Verify that missing fields fall back to defaults when deserializing.
    #[test]
    fn test_partial_document_uses_defaults() {
        let config: QueueConfig = serde_json::from_str(
            r#"{ "max_delivery_attempts": 3, "storage": { "type": "filesystem", "path": "/var/lib/lq" } }"#,
        )
        .unwrap();

        assert_eq!(config.max_delivery_attempts, 3);
        assert_eq!(config.default_lease_duration_ms, 30_000);
        assert_eq!(
            config.storage,
            StorageConfig::Filesystem {
                path: PathBuf::from("/var/lib/lq")
            }
        );
    }

    /// Verify that unusable values are rejected.
    #[test]
    fn test_validate_rejects_bad_values() {
        let cases = [
            QueueConfig {
                max_delivery_attempts: 0,
                ..QueueConfig::default()
            },
            QueueConfig {
                max_dequeue_attempts: 0,
                ..QueueConfig::default()
            },
            QueueConfig {
                base_delay_ms: 10_000,
                max_backoff_ms: 1_000,
                ..QueueConfig::default()
            },
            QueueConfig {
                default_lease_duration_ms: 0,
                ..QueueConfig::default()
            },
            QueueConfig {
                reap_interval_ms: 0,
                ..QueueConfig::default()
            },
            QueueConfig {
                max_payload_bytes: 0,
                ..QueueConfig::default()
            },
        ];

        for config in cases {
            assert!(
                matches!(config.validate(), Err(ConfigurationError::Invalid { .. })),
                "expected {:?} to be rejected",
                config
            );
        }
    }

    /// Verify that a filesystem backend needs a path.
    #[test]
    fn test_validate_requires_storage_path() {
        let config = QueueConfig {
            storage: StorageConfig::Filesystem {
                path: PathBuf::new(),
            },
            ..QueueConfig::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::Missing { key }) if key == "storage.path"
        ));
    }

    /// Verify that huge millisecond values saturate instead of overflowing.
    #[test]
    fn test_huge_durations_saturate() {
        let config = QueueConfig {
            default_lease_duration_ms: u64::MAX,
            ..QueueConfig::default()
        };

        assert_eq!(config.default_lease_duration(), Duration::MAX);
    }
}

mod worker_config {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkerConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.lease_duration(), Duration::seconds(30));
        assert_eq!(config.poll_interval(), Duration::milliseconds(500));
        assert_eq!(config.heartbeat_interval(), Duration::seconds(10));
        assert_eq!(config.max_tasks, None);
        assert!(!config.stop_when_empty);
    }

    /// Verify that the heartbeat must fire before the lease runs out.
    #[test]
    fn test_heartbeat_must_be_shorter_than_lease() {
        let config = WorkerConfig {
            lease_duration_ms: 5_000,
            heartbeat_interval_ms: 5_000,
            ..WorkerConfig::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::Invalid { .. })
        ));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let config = WorkerConfig {
            poll_interval_ms: 0,
            ..WorkerConfig::default()
        };

        assert!(config.validate().is_err());
    }
}
