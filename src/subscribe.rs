use alloc::vec::Vec;

use crate::{Error, QoS, StringView};

/// One topic filter requested in a SUBSCRIBE.
#[derive(Debug, Default)]
pub struct Subscription {
    pub topic: StringView,
    pub qos: QoS,
    /// Granted level, filled in from the SUBACK.
    pub return_code: Option<SubscribeReturnCode>,
}

impl Subscription {
    pub fn new(topic: impl Into<StringView>, qos: QoS) -> Self {
        Subscription {
            topic: topic.into(),
            qos,
            return_code: None,
        }
    }
}

/// Subscribe request: an ordered, non-empty list of topic filters.
#[derive(Debug, Default)]
pub struct Subscribe {
    pub subscriptions: Vec<Subscription>,
}

impl Subscribe {
    pub fn new(subscriptions: Vec<Subscription>) -> Self {
        Subscribe { subscriptions }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.subscriptions.is_empty() {
            return Err(Error::InvalidPacket);
        }
        for sub in &self.subscriptions {
            validate_topic(&sub.topic)?;
        }
        Ok(())
    }

    /// Packet id plus, per filter, the prefixed topic and the QoS byte.
    pub(crate) fn remaining_length(&self) -> usize {
        2 + self
            .subscriptions
            .iter()
            .map(|s| 2 + s.topic.len() + 1)
            .sum::<usize>()
    }
}

/// Unsubscribe request: an ordered, non-empty list of topic filters.
#[derive(Debug, Default)]
pub struct Unsubscribe {
    pub topics: Vec<StringView>,
}

impl Unsubscribe {
    pub fn new(topics: Vec<StringView>) -> Self {
        Unsubscribe { topics }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.topics.is_empty() {
            return Err(Error::InvalidPacket);
        }
        for topic in &self.topics {
            validate_topic(topic)?;
        }
        Ok(())
    }

    pub(crate) fn remaining_length(&self) -> usize {
        2 + self.topics.iter().map(|t| 2 + t.len()).sum::<usize>()
    }
}

fn validate_topic(topic: &StringView) -> Result<(), Error> {
    if topic.is_empty() || !topic.fits_field() || !topic.is_source() || !topic.is_valid_utf8() {
        return Err(Error::InvalidPacket);
    }
    Ok(())
}

/// Return code granted per subscription in a SUBACK.
///
/// [MQTT 3.9.3]: http://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718071
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscribeReturnCode {
    MaxLevel0 = 0,
    MaxLevel1 = 1,
    MaxLevel2 = 2,
    Failure = 0x80,
}

impl SubscribeReturnCode {
    pub fn from_u8(byte: u8) -> Result<SubscribeReturnCode, Error> {
        match byte {
            0 => Ok(SubscribeReturnCode::MaxLevel0),
            1 => Ok(SubscribeReturnCode::MaxLevel1),
            2 => Ok(SubscribeReturnCode::MaxLevel2),
            0x80 => Ok(SubscribeReturnCode::Failure),
            _ => Err(Error::DecodeSubackInvalidReturnCode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn empty_subscribe_is_invalid() {
        assert_eq!(Subscribe::default().validate(), Err(Error::InvalidPacket));
        assert_eq!(Unsubscribe::default().validate(), Err(Error::InvalidPacket));
    }

    #[test]
    fn empty_topic_is_invalid() {
        let sub = Subscribe::new(vec![Subscription::new("", QoS::Level0)]);
        assert_eq!(sub.validate(), Err(Error::InvalidPacket));
    }

    #[test]
    fn remaining_lengths() {
        let sub = Subscribe::new(vec![
            Subscription::new("a/b", QoS::Level1),
            Subscription::new("c", QoS::Level0),
        ]);
        assert!(sub.validate().is_ok());
        assert_eq!(sub.remaining_length(), 2 + (2 + 3 + 1) + (2 + 1 + 1));

        let unsub = Unsubscribe::new(vec![StringView::from("a/b")]);
        assert_eq!(unsub.remaining_length(), 2 + (2 + 3));
    }

    #[test]
    fn suback_return_codes() {
        assert_eq!(
            SubscribeReturnCode::from_u8(0x80).unwrap(),
            SubscribeReturnCode::Failure
        );
        assert!(SubscribeReturnCode::from_u8(3).is_err());
    }
}
