use crate::amqp::constants::{ENQUEUED_TIME_ANNOTATION, OFFSET_ANNOTATION};
use crate::common::{MessagingError, MessagingResult};
use crate::config::validate_prefetch_count;
use chrono::{DateTime, Utc};

/// Offset meaning "before the first event in the partition".
pub const START_OF_STREAM: &str = "-1";

/// Where a new receiver starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPosition {
    Offset { offset: String, inclusive: bool },
    EnqueuedTime(DateTime<Utc>),
}

impl StartPosition {
    pub fn start_of_stream() -> Self {
        Self::from_offset(START_OF_STREAM, false)
    }

    pub fn from_offset(offset: impl Into<String>, inclusive: bool) -> Self {
        Self::Offset {
            offset: offset.into(),
            inclusive,
        }
    }

    pub fn from_enqueued_time(enqueued_time: DateTime<Utc>) -> Self {
        Self::EnqueuedTime(enqueued_time)
    }

    /// Selector expression for the link source filter.
    pub fn filter_expression(&self) -> String {
        match self {
            Self::Offset { offset, inclusive } => format!(
                "amqp.annotation.{OFFSET_ANNOTATION} {} '{offset}'",
                if *inclusive { ">=" } else { ">" }
            ),
            Self::EnqueuedTime(at) => format!(
                "amqp.annotation.{ENQUEUED_TIME_ANNOTATION} > '{}'",
                at.timestamp_millis()
            ),
        }
    }
}

/// Parameters for [`MessageReceiver::create`](super::MessageReceiver::create).
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    /// Stable client id; keys the retry counters.
    pub name: String,
    /// Link address, e.g. `<hub>/ConsumerGroups/<group>/Partitions/<id>`.
    pub receive_path: String,
    pub start_position: StartPosition,
    /// Falls back to the factory's configured prefetch when unset.
    pub prefetch_count: Option<u32>,
    /// Present for exclusive (epoch) receivers.
    pub epoch: Option<i64>,
}

impl ReceiverOptions {
    pub fn new(
        name: impl Into<String>,
        receive_path: impl Into<String>,
        start_position: StartPosition,
    ) -> Self {
        Self {
            name: name.into(),
            receive_path: receive_path.into(),
            start_position,
            prefetch_count: None,
            epoch: None,
        }
    }

    pub fn with_prefetch_count(mut self, prefetch_count: u32) -> Self {
        self.prefetch_count = Some(prefetch_count);
        self
    }

    pub fn with_epoch(mut self, epoch: i64) -> Self {
        self.epoch = Some(epoch);
        self
    }

    pub(crate) fn validate(&self, prefetch_count: u32) -> MessagingResult<()> {
        if self.name.trim().is_empty() {
            return Err(MessagingError::InvalidArgument(
                "receiver name must not be empty".to_string(),
            ));
        }
        if self.receive_path.trim().is_empty() {
            return Err(MessagingError::InvalidArgument(
                "receive path must not be empty".to_string(),
            ));
        }
        validate_prefetch_count(prefetch_count)
            .map_err(|e| MessagingError::InvalidArgument(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::*;

    #[test]
    fn test_offset_filter_respects_inclusiveness() {
        assert_eq!(
            StartPosition::from_offset("4096", false).filter_expression(),
            "amqp.annotation.x-opt-offset > '4096'"
        );
        assert_eq!(
            StartPosition::from_offset("4096", true).filter_expression(),
            "amqp.annotation.x-opt-offset >= '4096'"
        );
        assert_eq!(
            StartPosition::start_of_stream().filter_expression(),
            "amqp.annotation.x-opt-offset > '-1'"
        );
    }

    #[test]
    fn test_enqueued_time_filter_uses_epoch_millis() {
        let at = assert_some!(DateTime::from_timestamp_millis(1_700_000_000_123));
        assert_eq!(
            StartPosition::from_enqueued_time(at).filter_expression(),
            "amqp.annotation.x-opt-enqueued-time > '1700000000123'"
        );
    }

    #[test]
    fn test_validation() {
        let options = ReceiverOptions::new("r1", "hub/ConsumerGroups/$default/Partitions/0", StartPosition::start_of_stream());
        assert_ok!(options.validate(300));
        assert_matches!(options.validate(9), Err(MessagingError::InvalidArgument(_)));
        assert_matches!(options.validate(1000), Err(MessagingError::InvalidArgument(_)));

        let unnamed = ReceiverOptions::new(" ", "path", StartPosition::start_of_stream());
        assert_matches!(unnamed.validate(300), Err(MessagingError::InvalidArgument(_)));
    }
}
