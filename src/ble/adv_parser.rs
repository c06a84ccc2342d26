//! Advertisement payload parsing.
//!
//! Advertising data is a stream of `[len][type][len - 1 bytes of value]`
//! records. Every lookup here stays inside the declared payload: a record
//! whose length runs past the end of the buffer ends the scan as "not
//! found".

use heapless::String;

use crate::config::{TargetIdentity, TargetMatch};

/// AD type: incomplete list of 16-bit service UUIDs.
pub const AD_TYPE_UUID16_INCOMPLETE: u8 = 0x02;
/// AD type: complete list of 16-bit service UUIDs.
pub const AD_TYPE_UUID16_COMPLETE: u8 = 0x03;
/// AD type: shortened local name.
pub const AD_TYPE_SHORT_LOCAL_NAME: u8 = 0x08;
/// AD type: complete local name.
pub const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;

/// Iterator over the well-formed `(type, value)` records of a payload.
pub struct AdFields<'a> {
    data: &'a [u8],
    index: usize,
}

impl<'a> AdFields<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, index: 0 }
    }
}

impl<'a> Iterator for AdFields<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let len = *self.data.get(self.index)? as usize;
        // A zero length terminates the significant part; a length that
        // overruns the buffer is malformed.
        if len == 0 || self.index + len >= self.data.len() {
            self.index = self.data.len();
            return None;
        }
        let ad_type = self.data[self.index + 1];
        let value = &self.data[self.index + 2..self.index + 1 + len];
        self.index += len + 1;
        Some((ad_type, value))
    }
}

/// Value of the first record of type `ad_type`.
pub fn find_field(data: &[u8], ad_type: u8) -> Option<&[u8]> {
    AdFields::new(data).find(|(t, _)| *t == ad_type).map(|(_, v)| v)
}

/// Index of the first name in `names` that exactly equals the advertised
/// complete local name.
pub fn find_adv_name(data: &[u8], names: &[&str]) -> Option<usize> {
    let adv_name = find_field(data, AD_TYPE_COMPLETE_LOCAL_NAME)?;
    names.iter().position(|n| n.as_bytes() == adv_name)
}

/// Check whether any 16-bit UUID list (incomplete or complete) contains
/// `uuid`.
pub fn find_adv_uuid(data: &[u8], uuid: u16) -> bool {
    AdFields::new(data)
        .filter(|(ad_type, _)| matches!(*ad_type, AD_TYPE_UUID16_INCOMPLETE | AD_TYPE_UUID16_COMPLETE))
        .any(|(_, list)| {
            list.chunks_exact(2)
                .any(|c| u16::from_le_bytes([c[0], c[1]]) == uuid)
        })
}

/// Index of the first target identity the advertisement matches.
pub fn find_target(data: &[u8], targets: &[TargetIdentity]) -> Option<usize> {
    let adv_name = find_field(data, AD_TYPE_COMPLETE_LOCAL_NAME);
    targets.iter().position(|t| match &t.matcher {
        TargetMatch::Name(name) => adv_name == Some(name.as_bytes()),
        TargetMatch::Uuid16(uuid) => find_adv_uuid(data, *uuid),
    })
}

/// Extract complete/shortened local name from advertisement data.
pub fn extract_device_name(data: &[u8]) -> String<32> {
    let name = find_field(data, AD_TYPE_COMPLETE_LOCAL_NAME)
        .or_else(|| find_field(data, AD_TYPE_SHORT_LOCAL_NAME));

    let mut s = String::new();
    match name {
        Some(bytes) => {
            for &b in bytes {
                if s.push(b as char).is_err() {
                    break;
                }
            }
        }
        None => {
            let _ = s.push_str("Unknown");
        }
    }
    s
}
