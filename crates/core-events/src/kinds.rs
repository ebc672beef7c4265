//! Discriminant enums for the event record.
//!
//! Raw bytes come off a shared page written by the peer, so every enum has a
//! checked `from_raw` and the record stores the byte, not the enum.

/// Top-level event category.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Target = 1,
    External = 2,
    Io = 3,
}

impl Category {
    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Target),
            2 => Some(Self::External),
            3 => Some(Self::Io),
            _ => None,
        }
    }
}

/// Server-to-client lifecycle and hint commands.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Exit = 1,
    Reset = 2,
    Pause = 3,
    Unpause = 4,
    Activate = 5,
    DisplayHint = 6,
    FontHint = 7,
    OutputHint = 8,
    GraphMode = 9,
    GeoHint = 10,
    DeviceNode = 11,
    Store = 12,
    Restore = 13,
    BchunkIn = 14,
    BchunkOut = 15,
    StepFrame = 16,
    NewSegment = 17,
    RequestFail = 18,
    Message = 19,
    BufferFail = 20,
}

impl TargetKind {
    pub fn from_raw(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Exit,
            2 => Self::Reset,
            3 => Self::Pause,
            4 => Self::Unpause,
            5 => Self::Activate,
            6 => Self::DisplayHint,
            7 => Self::FontHint,
            8 => Self::OutputHint,
            9 => Self::GraphMode,
            10 => Self::GeoHint,
            11 => Self::DeviceNode,
            12 => Self::Store,
            13 => Self::Restore,
            14 => Self::BchunkIn,
            15 => Self::BchunkOut,
            16 => Self::StepFrame,
            17 => Self::NewSegment,
            18 => Self::RequestFail,
            19 => Self::Message,
            20 => Self::BufferFail,
            _ => return None,
        })
    }

    /// The enumerated subset that pairs with a descriptor on the socket.
    /// FONTHINT and DEVICE_NODE are conditional on their argument words and
    /// gated again at the pump; the rest always escrow.
    pub fn descriptor_bearing(self) -> bool {
        matches!(
            self,
            Self::Store
                | Self::Restore
                | Self::DeviceNode
                | Self::FontHint
                | Self::BchunkIn
                | Self::BchunkOut
                | Self::NewSegment
        )
    }
}

/// Client-to-server events.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalKind {
    Register = 1,
    Ident = 2,
    SegReq = 3,
    Message = 4,
    BufferStream = 5,
    Viewport = 6,
    Clock = 7,
}

impl ExternalKind {
    pub fn from_raw(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Register,
            2 => Self::Ident,
            3 => Self::SegReq,
            4 => Self::Message,
            5 => Self::BufferStream,
            6 => Self::Viewport,
            7 => Self::Clock,
            _ => return None,
        })
    }
}

/// IO sample device class.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDeviceKind {
    Keyboard = 1,
    Mouse = 2,
    GameDev = 3,
    Touch = 4,
}

impl IoDeviceKind {
    pub fn from_raw(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Keyboard,
            2 => Self::Mouse,
            3 => Self::GameDev,
            4 => Self::Touch,
            _ => return None,
        })
    }
}

/// IO sample data representation.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDataType {
    Translated = 1,
    Analog = 2,
    Digital = 3,
    Touch = 4,
}

impl IoDataType {
    pub fn from_raw(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Translated,
            2 => Self::Analog,
            3 => Self::Digital,
            4 => Self::Touch,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        for v in 0..=32u8 {
            if let Some(k) = TargetKind::from_raw(v) {
                assert_eq!(k as u8, v);
            }
            if let Some(k) = ExternalKind::from_raw(v) {
                assert_eq!(k as u8, v);
            }
        }
        assert_eq!(Category::from_raw(0), None);
        assert_eq!(Category::from_raw(4), None);
    }

    #[test]
    fn descriptor_bearing_subset() {
        assert!(TargetKind::NewSegment.descriptor_bearing());
        assert!(TargetKind::BchunkOut.descriptor_bearing());
        assert!(!TargetKind::DisplayHint.descriptor_bearing());
        assert!(!TargetKind::Exit.descriptor_bearing());
    }
}
