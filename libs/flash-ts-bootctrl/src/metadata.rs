//! The 32-byte A/B boot control block, as shared with the bootloader.
//!
//! | bytes      | field                                                     |
//! |------------|-----------------------------------------------------------|
//! | `[0..4]`   | suffix of the active slot, `"_a"` or `"_b"`, NUL padded   |
//! | `[4..8]`   | magic, little-endian                                      |
//! | `[8]`      | layout version                                            |
//! | `[9]`      | `nb_slot:3`, `recovery_tries_remaining:3`                 |
//! | `[12..20]` | four 2-byte [SlotMetadata] entries                        |
//! | `[28..32]` | CRC-32 over `[0..28]`, little-endian                      |
//!
//! All other bytes are reserved and written as zero.
use num_enum::IntoPrimitive;

pub const METADATA_SIZE: usize = 32;

/// "BCAB" when read as little-endian.
pub const BOOT_CTRL_MAGIC: u32 = 0x4241_4342;

pub const BOOT_CTRL_VERSION: u8 = 1;

/// Number of slot entries in the layout, of which only [Slot::A] and [Slot::B] are used.
pub const MAX_SLOTS: usize = 4;

pub const MAX_PRIORITY: u8 = 15;
pub const MAX_TRIES: u8 = 7;

const SUFFIX_OFFSET: usize = 0;
const MAGIC_OFFSET: usize = 4;
const VERSION_OFFSET: usize = 8;
const SLOT_COUNT_OFFSET: usize = 9;
const SLOT_INFO_OFFSET: usize = 12;
const CRC_OFFSET: usize = 28;

const CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// A/B image slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Slot {
    A = 0,
    B = 1,
}

impl Slot {
    pub const ALL: [Slot; 2] = [Slot::A, Slot::B];

    /// Partition name suffix of the slot.
    pub const fn suffix(self) -> &'static str {
        match self {
            Slot::A => "_a",
            Slot::B => "_b",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Slot::ALL.into_iter().find(|slot| slot.suffix() == suffix)
    }

    pub const fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    fn index(self) -> usize {
        u8::from(self).into()
    }
}

impl core::fmt::Display for Slot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Boot state of a single slot, packed into two bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlotMetadata {
    /// 0 means the slot is unbootable, 15 is the highest priority.
    pub priority: u8,
    /// Boot attempts left before the slot is given up on. Ignored once [Self::successful_boot] is set.
    pub tries_remaining: u8,
    pub successful_boot: bool,
    pub verity_corrupted: bool,
}

impl SlotMetadata {
    pub const UNBOOTABLE: Self = Self {
        priority: 0,
        tries_remaining: 0,
        successful_boot: false,
        verity_corrupted: false,
    };

    pub const fn new(priority: u8) -> Self {
        Self {
            priority,
            tries_remaining: MAX_TRIES,
            successful_boot: false,
            verity_corrupted: false,
        }
    }

    pub const fn is_bootable(&self) -> bool {
        self.priority > 0 && (self.successful_boot || self.tries_remaining > 0)
    }

    pub const fn pack(&self) -> [u8; 2] {
        let mut flags = self.priority & 0x0f;
        flags |= (self.tries_remaining & 0x07) << 4;
        flags |= (self.successful_boot as u8) << 7;
        [flags, self.verity_corrupted as u8]
    }

    pub const fn unpack(bytes: [u8; 2]) -> Self {
        Self {
            priority: bytes[0] & 0x0f,
            tries_remaining: (bytes[0] >> 4) & 0x07,
            successful_boot: bytes[0] >> 7 != 0,
            verity_corrupted: bytes[1] & 0x01 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseResult {
    /// Metadata yet to be written.
    Unset,
    /// Metadata failed magic, version, checksum or field validation.
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootControl {
    /// Slot the bootloader last decided to boot.
    pub active: Slot,
    pub nb_slot: u8,
    pub recovery_tries_remaining: u8,
    pub slots: [SlotMetadata; MAX_SLOTS],
}

impl Default for BootControl {
    fn default() -> Self {
        let mut slots = [SlotMetadata::UNBOOTABLE; MAX_SLOTS];
        slots[Slot::A.index()] = SlotMetadata::new(MAX_PRIORITY);
        slots[Slot::B.index()] = SlotMetadata::new(MAX_PRIORITY - 1);
        Self {
            active: Slot::A,
            nb_slot: Slot::ALL.len() as u8,
            recovery_tries_remaining: 0,
            slots,
        }
    }
}

impl BootControl {
    pub fn slot(&self, slot: Slot) -> &SlotMetadata {
        &self.slots[slot.index()]
    }

    pub fn slot_mut(&mut self, slot: Slot) -> &mut SlotMetadata {
        &mut self.slots[slot.index()]
    }

    /// The slot with the highest priority, preferring [Slot::A] on a tie.
    pub fn highest_priority(&self, bootable_only: bool) -> Option<Slot> {
        Slot::ALL
            .into_iter()
            .filter(|slot| {
                let metadata = self.slot(*slot);
                metadata.priority > 0 && (!bootable_only || metadata.is_bootable())
            })
            .fold(None, |best: Option<Slot>, slot| match best {
                Some(best) if self.slot(best).priority >= self.slot(slot).priority => Some(best),
                _ => Some(slot),
            })
    }

    pub fn to_bytes(&self) -> [u8; METADATA_SIZE] {
        let mut bytes = [0u8; METADATA_SIZE];

        let suffix = self.active.suffix().as_bytes();
        bytes[SUFFIX_OFFSET..SUFFIX_OFFSET + suffix.len()].copy_from_slice(suffix);
        bytes[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&BOOT_CTRL_MAGIC.to_le_bytes());
        bytes[VERSION_OFFSET] = BOOT_CTRL_VERSION;
        bytes[SLOT_COUNT_OFFSET] = (self.nb_slot & 0x07) | ((self.recovery_tries_remaining & 0x07) << 3);

        for (i, slot) in self.slots.iter().enumerate() {
            let offset = SLOT_INFO_OFFSET + 2 * i;
            bytes[offset..offset + 2].copy_from_slice(&slot.pack());
        }

        let crc = CRC.checksum(&bytes[..CRC_OFFSET]);
        bytes[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; METADATA_SIZE]) -> Result<Self, ParseResult> {
        if bytes.iter().all(|b| *b == 0xff) {
            return Err(ParseResult::Unset);
        }

        let read_u32 = |offset: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&bytes[offset..offset + 4]);
            u32::from_le_bytes(word)
        };

        if read_u32(MAGIC_OFFSET) != BOOT_CTRL_MAGIC
            || bytes[VERSION_OFFSET] != BOOT_CTRL_VERSION
            || read_u32(CRC_OFFSET) != CRC.checksum(&bytes[..CRC_OFFSET])
        {
            return Err(ParseResult::Invalid);
        }

        let suffix = &bytes[SUFFIX_OFFSET..MAGIC_OFFSET];
        let len = suffix.iter().position(|b| *b == 0).unwrap_or(suffix.len());
        let active = core::str::from_utf8(&suffix[..len])
            .ok()
            .and_then(Slot::from_suffix)
            .ok_or(ParseResult::Invalid)?;

        let nb_slot = bytes[SLOT_COUNT_OFFSET] & 0x07;
        if !(1..=MAX_SLOTS as u8).contains(&nb_slot) {
            return Err(ParseResult::Invalid);
        }

        let mut slots = [SlotMetadata::UNBOOTABLE; MAX_SLOTS];
        for (i, slot) in slots.iter_mut().enumerate() {
            let offset = SLOT_INFO_OFFSET + 2 * i;
            *slot = SlotMetadata::unpack([bytes[offset], bytes[offset + 1]]);
        }

        Ok(Self {
            active,
            nb_slot,
            recovery_tries_remaining: (bytes[SLOT_COUNT_OFFSET] >> 3) & 0x07,
            slots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_metadata_packing() {
        let metadata = SlotMetadata {
            priority: 14,
            tries_remaining: 5,
            successful_boot: true,
            verity_corrupted: true,
        };
        assert_eq!(metadata.pack(), [0b1101_1110, 0x01]);
        assert_eq!(SlotMetadata::unpack(metadata.pack()), metadata);
        assert_eq!(SlotMetadata::UNBOOTABLE.pack(), [0, 0]);
    }

    #[test]
    fn default_layout() {
        let bytes = BootControl::default().to_bytes();
        assert_eq!(&bytes[0..4], b"_a\0\0");
        assert_eq!(&bytes[4..8], b"BCAB");
        assert_eq!(bytes[8], 1);
        assert_eq!(bytes[9], 2);
        assert_eq!(&bytes[12..16], &[0x7f, 0, 0x7e, 0]);
        assert!(bytes[16..28].iter().all(|b| *b == 0));

        assert_eq!(BootControl::from_bytes(&bytes), Ok(BootControl::default()));
    }

    #[test]
    fn rejects_damage() {
        assert_eq!(BootControl::from_bytes(&[0xff; METADATA_SIZE]), Err(ParseResult::Unset));
        assert_eq!(BootControl::from_bytes(&[0; METADATA_SIZE]), Err(ParseResult::Invalid));

        let valid = BootControl::default().to_bytes();
        for i in 0..METADATA_SIZE {
            let mut bytes = valid;
            bytes[i] ^= 0x10;
            assert_eq!(BootControl::from_bytes(&bytes), Err(ParseResult::Invalid), "byte {i}");
        }
    }

    #[test]
    fn highest_priority() {
        let mut control = BootControl::default();
        assert_eq!(control.highest_priority(true), Some(Slot::A));

        control.slot_mut(Slot::A).tries_remaining = 0;
        assert_eq!(control.highest_priority(false), Some(Slot::A));
        assert_eq!(control.highest_priority(true), Some(Slot::B));

        control.slot_mut(Slot::B).priority = 15;
        assert_eq!(control.highest_priority(false), Some(Slot::A));

        control.slot_mut(Slot::B).priority = 0;
        assert_eq!(control.highest_priority(true), None);
    }

    #[test]
    fn suffixes() {
        assert_eq!(Slot::from_suffix("_b"), Some(Slot::B));
        assert_eq!(Slot::from_suffix("_c"), None);
        assert_eq!(Slot::A.other(), Slot::B);
        assert_eq!(u8::from(Slot::B), 1);
    }
}
