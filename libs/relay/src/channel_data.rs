use std::io;

/// A parsed TURN ChannelData frame.
///
/// Wire layout: 2 bytes channel number, 2 bytes payload length, payload,
/// zero-padding up to the next 4-byte boundary. The length field counts the
/// payload only, not the padding.
#[derive(Debug, PartialEq, Eq)]
pub struct ChannelData<'a> {
    channel: u16,
    data: &'a [u8],
}

impl<'a> ChannelData<'a> {
    pub fn parse(frame: &'a [u8]) -> io::Result<Self> {
        if frame.len() < 4 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "channel data messages are at least 4 bytes",
            ));
        }

        let channel = u16::from_be_bytes([frame[0], frame[1]]);
        if !crate::CHANNEL_NUMBER_RANGE.contains(&channel) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{channel:#06x} is not a valid channel number"),
            ));
        }

        let length = u16::from_be_bytes([frame[2], frame[3]]) as usize;

        if frame.len() - 4 < length {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "channel data message is shorter than its length field",
            ));
        }

        // Anything past `length` must be padding to a 4-byte boundary.
        if frame.len() - 4 > padded_len(length) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "trailing bytes after channel data padding",
            ));
        }

        Ok(Self {
            channel,
            data: &frame[4..4 + length],
        })
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

/// Builds a ChannelData frame, padded to a 4-byte boundary.
pub fn make(channel: u16, data: &[u8]) -> Vec<u8> {
    debug_assert!(crate::CHANNEL_NUMBER_RANGE.contains(&channel));

    let mut frame = Vec::with_capacity(4 + padded_len(data.len()));

    frame.extend_from_slice(&channel.to_be_bytes());
    frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
    frame.extend_from_slice(data);
    frame.resize(4 + padded_len(data.len()), 0);

    frame
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(4) * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_channel_number_outside_turn_range() {
        let err = ChannelData::parse(&[0x3F, 0xFF, 0x00, 0x00]).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn length_field_counts_payload_not_padding() {
        let frame = make(0x4000, b"abcde");

        assert_eq!(frame.len(), 4 + 8);
        assert_eq!(u16::from_be_bytes([frame[2], frame[3]]), 5);

        let parsed = ChannelData::parse(&frame).unwrap();
        assert_eq!(parsed.channel(), 0x4000);
        assert_eq!(parsed.data(), b"abcde");
    }

    #[test]
    fn short_frame_is_rejected() {
        assert!(ChannelData::parse(&[0x40]).is_err());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut frame = make(0x4001, &[1, 2, 3, 4, 5, 6]);
        frame.truncate(8);

        assert!(ChannelData::parse(&frame).is_err());
    }
}
