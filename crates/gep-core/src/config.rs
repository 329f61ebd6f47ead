//! Publisher, subscriber and subscription configuration.
//!
//! Subscriptions are configured by the connection string carried in the
//! `Subscribe` command: `key=value` pairs separated by `;`, keys
//! case-insensitive, values optionally wrapped in braces so they can contain
//! `;` themselves (`inputMeasurementKeys={a;b};dataChannel={port=9191}`).

use std::{collections::HashMap, time::Duration};

use gep_proto::{OperationalModes, SecurityMode, SignalId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SessionError;

/// Publisher-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Command channel security mode
    pub security_mode: SecurityMode,
    /// Period of the shared cipher key rotation timer
    pub cipher_key_rotation_period: Duration,
    /// Minimum spacing between two rotations on one connection
    pub min_cipher_rotation_spacing: Duration,
    /// Interval between `NoOP` keep-alives
    pub keep_alive_interval: Duration,
    /// Accept synchronized (time-aligned) subscriptions
    pub allow_synchronized_subscription: bool,
    /// Compress payloads for clients that ask for it
    pub allow_payload_compression: bool,
    /// Serve `MetaDataRefresh`
    pub allow_metadata_refresh: bool,
    /// Seal data packets with rotating cipher keys
    pub encrypt_payload: bool,
    /// Upper bound on retained, unconfirmed notifications per connection
    pub notification_retention: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            security_mode: SecurityMode::None,
            cipher_key_rotation_period: Duration::from_secs(60),
            min_cipher_rotation_spacing: Duration::from_millis(1000),
            keep_alive_interval: Duration::from_secs(5),
            allow_synchronized_subscription: true,
            allow_payload_compression: true,
            allow_metadata_refresh: true,
            encrypt_payload: false,
            notification_retention: 256,
        }
    }
}

/// Subscriber-side configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct SubscriberConfig {
    /// Security mode of the publisher being connected to
    pub security_mode: SecurityMode,
    /// Operational modes sent on connect
    pub operational_modes: OperationalModes,
    /// Key presented by `Authenticate` (Gateway mode)
    pub auth_key: Option<String>,
    /// Pre-shared secret used to seal the token and open cipher keys
    pub shared_secret: Option<String>,
    /// Restart the connection cycle when no data arrives for this long
    pub data_loss_interval: Duration,
    /// Parse faults tolerated inside one window
    pub allowed_parsing_exceptions: usize,
    /// Parse fault window
    pub parsing_exception_window: Duration,
    /// Receiver pending-list bound for buffer blocks
    pub max_pending_buffer_blocks: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            security_mode: SecurityMode::None,
            operational_modes: OperationalModes::from_u32(0),
            auth_key: None,
            shared_secret: None,
            data_loss_interval: Duration::from_secs(10),
            allowed_parsing_exceptions: 10,
            parsing_exception_window: Duration::from_secs(5),
            max_pending_buffer_blocks: 4096,
        }
    }
}

impl std::fmt::Debug for SubscriberConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberConfig")
            .field("security_mode", &self.security_mode)
            .field("operational_modes", &self.operational_modes)
            .field("auth_key", &self.auth_key.as_ref().map(|_| "<redacted>"))
            .field("shared_secret", &self.shared_secret.as_ref().map(|_| "<redacted>"))
            .field("data_loss_interval", &self.data_loss_interval)
            .field("allowed_parsing_exceptions", &self.allowed_parsing_exceptions)
            .field("parsing_exception_window", &self.parsing_exception_window)
            .field("max_pending_buffer_blocks", &self.max_pending_buffer_blocks)
            .finish()
    }
}

/// Settings parsed from a `Subscribe` connection string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSettings {
    /// Requested signals, in request order
    pub signals: Vec<SignalId>,
    /// Compact measurements carry their own time
    pub include_time: bool,
    /// Compact time offsets are whole milliseconds
    pub use_millisecond_resolution: bool,
    /// Processing interval in milliseconds (-1 = as fast as possible)
    pub processing_interval: i32,
    /// Minimum spacing between packets of one subscription (unset = no pacing)
    pub publish_interval: Option<Duration>,
    /// Lag time before a synchronized frame is released
    pub lag_time: Duration,
    /// Port of the negotiated connectionless data channel
    pub data_channel: Option<u16>,
    /// Buffer block retransmission timeout
    pub buffer_block_retransmission_timeout: Duration,
    /// Drop NaN values before publishing
    pub request_nan_value_filter: bool,
    /// Client assembly description (logged only)
    pub assembly_info: Option<String>,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            signals: Vec::new(),
            include_time: true,
            use_millisecond_resolution: false,
            processing_interval: -1,
            publish_interval: None,
            lag_time: Duration::from_secs(10),
            data_channel: None,
            buffer_block_retransmission_timeout: Duration::from_secs(5),
            request_nan_value_filter: false,
            assembly_info: None,
        }
    }
}

impl SubscriptionSettings {
    /// Parse a connection string. Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidSetting`] for a recognized key whose
    /// value does not parse.
    pub fn parse(connection_string: &str) -> Result<Self, SessionError> {
        let pairs = parse_connection_string(connection_string);
        let mut settings = Self::default();

        for (key, value) in &pairs {
            let invalid =
                || SessionError::InvalidSetting { key: key.clone(), value: value.clone() };

            match key.as_str() {
                "inputmeasurementkeys" => {
                    settings.signals = value
                        .split([';', ','])
                        .map(str::trim)
                        .filter(|token| !token.is_empty())
                        .map(|token| Uuid::parse_str(token).map_err(|_| invalid()))
                        .collect::<Result<_, _>>()?;
                },
                "includetime" => settings.include_time = parse_bool(value).ok_or_else(invalid)?,
                "usemillisecondresolution" => {
                    settings.use_millisecond_resolution = parse_bool(value).ok_or_else(invalid)?;
                },
                "processinginterval" => {
                    settings.processing_interval = value.parse().map_err(|_| invalid())?;
                },
                "publishinterval" => {
                    settings.publish_interval = Some(parse_seconds(value).ok_or_else(invalid)?);
                },
                "lagtime" => settings.lag_time = parse_seconds(value).ok_or_else(invalid)?,
                "datachannel" => {
                    let channel = parse_connection_string(value);
                    let port = channel
                        .get("port")
                        .or_else(|| channel.get("localport"))
                        .ok_or_else(invalid)?;
                    settings.data_channel = Some(port.parse().map_err(|_| invalid())?);
                },
                "bufferblockretransmissiontimeout" => {
                    settings.buffer_block_retransmission_timeout =
                        parse_seconds(value).ok_or_else(invalid)?;
                },
                "requestnanvaluefilter" => {
                    settings.request_nan_value_filter = parse_bool(value).ok_or_else(invalid)?;
                },
                "assemblyinfo" => settings.assembly_info = Some(value.clone()),
                _ => {},
            }
        }

        Ok(settings)
    }

    /// Render as a connection string that [`SubscriptionSettings::parse`]
    /// reads back.
    #[must_use]
    pub fn to_connection_string(&self) -> String {
        let keys = self.signals.iter().map(Uuid::to_string).collect::<Vec<_>>().join(";");
        let mut out = format!(
            "inputMeasurementKeys={{{keys}}};includeTime={};useMillisecondResolution={};\
             processingInterval={};lagTime={};bufferBlockRetransmissionTimeout={};\
             requestNaNValueFilter={}",
            self.include_time,
            self.use_millisecond_resolution,
            self.processing_interval,
            self.lag_time.as_secs_f64(),
            self.buffer_block_retransmission_timeout.as_secs_f64(),
            self.request_nan_value_filter,
        );
        if let Some(interval) = self.publish_interval {
            out.push_str(&format!(";publishInterval={}", interval.as_secs_f64()));
        }
        if let Some(port) = self.data_channel {
            out.push_str(&format!(";dataChannel={{port={port}}}"));
        }
        if let Some(info) = &self.assembly_info {
            out.push_str(&format!(";assemblyInfo={{{info}}}"));
        }
        out
    }
}

/// Split a connection string into lowercase keys and unwrapped values.
///
/// Braces nest, so `;` and `=` inside `{...}` belong to the value. Later
/// duplicates win.
#[must_use]
pub fn parse_connection_string(input: &str) -> HashMap<String, String> {
    let mut pairs = HashMap::new();
    let mut depth = 0usize;
    let mut start = 0;

    let mut segments = Vec::new();
    for (i, ch) in input.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ';' if depth == 0 => {
                segments.push(&input[start..i]);
                start = i + 1;
            },
            _ => {},
        }
    }
    segments.push(&input[start..]);

    for segment in segments {
        let Some((key, value)) = segment.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        pairs.insert(key.to_ascii_lowercase(), unwrap_braces(value.trim()).to_string());
    }

    pairs
}

fn unwrap_braces(value: &str) -> &str {
    value
        .strip_prefix('{')
        .and_then(|inner| inner.strip_suffix('}'))
        .map_or(value, str::trim)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let seconds: f64 = value.parse().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn braces_protect_separators() {
        let pairs = parse_connection_string(
            "inputMeasurementKeys={a;b};DataChannel={port=9191; interface=0.0.0.0};x=1",
        );

        assert_eq!(pairs["inputmeasurementkeys"], "a;b");
        assert_eq!(pairs["datachannel"], "port=9191; interface=0.0.0.0");
        assert_eq!(pairs["x"], "1");
    }

    #[test]
    fn full_settings() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let settings = SubscriptionSettings::parse(&format!(
            "inputMeasurementKeys={{{a},{b}}};includeTime=false;useMillisecondResolution=True;\
             processingInterval=33;publishInterval=0.5;lagTime=2.5;dataChannel={{port=9191}};\
             bufferBlockRetransmissionTimeout=1;requestNaNValueFilter=true;assemblyInfo={{x; y}}"
        ))
        .unwrap();

        assert_eq!(settings.signals, vec![a, b]);
        assert!(!settings.include_time);
        assert!(settings.use_millisecond_resolution);
        assert_eq!(settings.processing_interval, 33);
        assert_eq!(settings.publish_interval, Some(Duration::from_millis(500)));
        assert_eq!(settings.lag_time, Duration::from_millis(2500));
        assert_eq!(settings.data_channel, Some(9191));
        assert_eq!(settings.buffer_block_retransmission_timeout, Duration::from_secs(1));
        assert!(settings.request_nan_value_filter);
        assert_eq!(settings.assembly_info.as_deref(), Some("x; y"));
    }

    #[test]
    fn defaults_when_empty() {
        assert_eq!(SubscriptionSettings::parse("").unwrap(), SubscriptionSettings::default());
    }

    #[test]
    fn bad_values_name_the_key() {
        assert_eq!(
            SubscriptionSettings::parse("includeTime=maybe"),
            Err(SessionError::InvalidSetting {
                key: "includetime".to_string(),
                value: "maybe".to_string()
            })
        );
        assert!(SubscriptionSettings::parse("inputMeasurementKeys={not-a-uuid}").is_err());
        assert!(SubscriptionSettings::parse("dataChannel={interface=x}").is_err());
    }

    #[test]
    fn secrets_are_redacted() {
        let config = SubscriberConfig {
            auth_key: Some("hunter2".to_string()),
            shared_secret: Some("s3cret".to_string()),
            ..SubscriberConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("s3cret"));
    }

    #[test]
    fn defaults() {
        let publisher = PublisherConfig::default();
        assert_eq!(publisher.cipher_key_rotation_period, Duration::from_secs(60));
        assert_eq!(publisher.min_cipher_rotation_spacing, Duration::from_millis(1000));

        let subscriber = SubscriberConfig::default();
        assert_eq!(subscriber.data_loss_interval, Duration::from_secs(10));
        assert_eq!(subscriber.allowed_parsing_exceptions, 10);
        assert_eq!(subscriber.parsing_exception_window, Duration::from_secs(5));
    }

    proptest! {
        #[test]
        fn rendered_settings_parse_back(
            ids in prop::collection::vec(1u128.., 0..8),
            include_time in any::<bool>(),
            millis in any::<bool>(),
            interval in -1i32..10_000,
            port in prop::option::of(1u16..),
        ) {
            let settings = SubscriptionSettings {
                signals: ids.into_iter().map(Uuid::from_u128).collect(),
                include_time,
                use_millisecond_resolution: millis,
                processing_interval: interval,
                data_channel: port,
                ..SubscriptionSettings::default()
            };
            prop_assert_eq!(SubscriptionSettings::parse(&settings.to_connection_string()).unwrap(), settings);
        }
    }
}
