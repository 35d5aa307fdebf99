//! A/B boot control on top of a flash translation store or a raw devinfo partition.
//!
//! [BootCtrl] implements the slot selection policy shared by the bootloader and
//! the update agent of the running system, and persists its state through any
//! [BootCtrlStore].
#![no_std]

extern crate alloc;

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod metadata;
pub mod store;

use defmt_or_log::{debug, info, warn};
use metadata::{BootControl, ParseResult, Slot, SlotMetadata, MAX_PRIORITY};
pub use store::{BootCtrlStore, DevinfoStore, FtsStore, COMMAND_SIZE};

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// The command does not fit in [COMMAND_SIZE] bytes, or contains a NUL byte.
    InvalidCommand,
    /// The underlying store threw an error.
    Store(E),
}

/// Boot command as stored in the command area.
pub type Command = heapless::String<COMMAND_SIZE>;

pub struct BootCtrl<S> {
    store: S,
    control: BootControl,
    /// The store holds a valid copy of `control`.
    stored: bool,
}

impl<S: BootCtrlStore> BootCtrl<S> {
    /// Load the boot control block, falling back to the defaults if it is absent or damaged.
    ///
    /// The defaults are only persisted by the first update.
    pub async fn load(mut store: S) -> Result<Self, Error<S::Error>> {
        let (control, stored) = match store.load().await.map_err(Error::Store)? {
            Some(bytes) => match BootControl::from_bytes(&bytes) {
                Ok(control) => {
                    info!("Loaded boot control, active slot {}", control.active.suffix());
                    (control, true)
                }
                Err(ParseResult::Unset) => (BootControl::default(), false),
                Err(ParseResult::Invalid) => {
                    warn!("Boot control is invalid, using defaults");
                    (BootControl::default(), false)
                }
            },
            None => {
                info!("No boot control stored yet, using defaults");
                (BootControl::default(), false)
            }
        };

        Ok(Self { store, control, stored })
    }

    pub fn control(&self) -> &BootControl {
        &self.control
    }

    /// The slot with the highest priority, whether or not it still has tries left.
    pub fn active_slot(&self) -> Option<Slot> {
        self.control.highest_priority(false)
    }

    /// Pick the slot to boot, consuming a try if it has not booted successfully yet.
    ///
    /// Slots that ran out of tries are made unbootable. Yields `None` when no slot is
    /// bootable, in which case the bootloader should fall back to recovery.
    pub async fn begin_boot(&mut self) -> Result<Option<Slot>, Error<S::Error>> {
        let mut control = self.control.clone();

        for slot in Slot::ALL {
            let metadata = control.slot_mut(slot);
            if metadata.priority > 0 && !metadata.is_bootable() {
                warn!("Slot {} ran out of tries", slot.suffix());
                *metadata = SlotMetadata::UNBOOTABLE;
            }
        }

        let chosen = control.highest_priority(true);
        match chosen {
            Some(slot) => {
                let metadata = control.slot_mut(slot);
                if !metadata.successful_boot {
                    metadata.tries_remaining -= 1;
                }
                control.active = slot;
                info!("Booting slot {}", slot.suffix());
            }
            None => warn!("No bootable slot left"),
        }

        self.commit(control).await?;
        Ok(chosen)
    }

    /// Mark `slot` as having booted successfully, to be booted from now on without consuming tries.
    pub async fn mark_successful(&mut self, slot: Slot) -> Result<(), Error<S::Error>> {
        let mut control = self.control.clone();
        let metadata = control.slot_mut(slot);
        metadata.successful_boot = true;
        metadata.tries_remaining = 0;
        self.commit(control).await
    }

    /// Make `slot` the one to boot next, typically after writing a new image to it.
    pub async fn set_active(&mut self, slot: Slot) -> Result<(), Error<S::Error>> {
        let mut control = self.control.clone();

        // The other slot stays around as fallback, just below the new one.
        let other = control.slot_mut(slot.other());
        if other.priority >= MAX_PRIORITY {
            other.priority = MAX_PRIORITY - 1;
        }

        *control.slot_mut(slot) = SlotMetadata::new(MAX_PRIORITY);
        self.commit(control).await
    }

    /// Never boot `slot` again, typically before writing a new image to it.
    pub async fn set_unbootable(&mut self, slot: Slot) -> Result<(), Error<S::Error>> {
        let mut control = self.control.clone();
        *control.slot_mut(slot) = SlotMetadata::UNBOOTABLE;
        self.commit(control).await
    }

    /// The pending boot command, if any.
    pub async fn boot_command(&mut self) -> Result<Option<Command>, Error<S::Error>> {
        let raw = self.store.read_command().await.map_err(Error::Store)?;
        let len = raw.iter().position(|b| *b == 0).unwrap_or(COMMAND_SIZE);
        if len == 0 {
            return Ok(None);
        }

        let Ok(text) = core::str::from_utf8(&raw[..len]) else {
            warn!("Ignoring boot command that is not UTF-8");
            return Ok(None);
        };
        let mut command = Command::new();
        command.push_str(text).map_err(|_| Error::InvalidCommand)?;
        Ok(Some(command))
    }

    /// Store a command for the bootloader, such as `boot-recovery`.
    pub async fn set_boot_command(&mut self, command: &str) -> Result<(), Error<S::Error>> {
        if command.len() > COMMAND_SIZE || command.bytes().any(|b| b == 0) {
            return Err(Error::InvalidCommand);
        }

        let mut raw = [0u8; COMMAND_SIZE];
        raw[..command.len()].copy_from_slice(command.as_bytes());
        debug!("Setting boot command");
        self.store.write_command(&raw).await.map_err(Error::Store)
    }

    pub async fn clear_boot_command(&mut self) -> Result<(), Error<S::Error>> {
        self.store.write_command(&[0u8; COMMAND_SIZE]).await.map_err(Error::Store)
    }

    pub fn into_inner(self) -> S {
        self.store
    }

    /// Persist `control` if it differs from the stored state, and adopt it once stored.
    async fn commit(&mut self, control: BootControl) -> Result<(), Error<S::Error>> {
        if self.stored && control == self.control {
            return Ok(());
        }

        self.store.save(&control.to_bytes()).await.map_err(Error::Store)?;
        self.control = control;
        self.stored = true;
        Ok(())
    }
}
