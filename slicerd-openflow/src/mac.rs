use core::{fmt, str::FromStr};

/// A 48-bit Ethernet MAC address.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Extract the destination and source MACs from an Ethernet frame.
    ///
    /// Returns `None` if the payload is shorter than the two address fields.
    /// Nothing past the first 12 bytes is inspected.
    pub fn from_frame(data: &[u8]) -> Option<(MacAddr, MacAddr)> {
        if data.len() < 12 {
            return None;
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&data[0..6]);
        src.copy_from_slice(&data[6..12]);
        Some((MacAddr(dst), MacAddr(src)))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid mac address '{0}'")]
pub struct ParseMacError(pub String);

impl FromStr for MacAddr {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_string()))?;
            if part.len() != 2 {
                return Err(ParseMacError(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError(s.to_string()));
        }
        Ok(MacAddr(octets))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let mac: MacAddr = "aa:bb:cc:00:11:22".parse().unwrap();
        assert_eq!(mac, MacAddr([0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]));
        assert_eq!(mac.to_string(), "aa:bb:cc:00:11:22");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("aa:bb:cc:00:11".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:00:11:22:33".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:00:11:2".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:00:11:zz".parse::<MacAddr>().is_err());
    }

    #[test]
    fn frame_extraction() {
        let mut frame = vec![0u8; 64];
        frame[0..6].copy_from_slice(&[0xff; 6]);
        frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
        let (dst, src) = MacAddr::from_frame(&frame).unwrap();
        assert_eq!(dst, MacAddr([0xff; 6]));
        assert_eq!(src, MacAddr([0x02, 0, 0, 0, 0, 0x01]));
        assert_eq!(MacAddr::from_frame(&frame[..11]), None);
    }
}
