//! Hostid fencing over the shared device.
//!
//! A reserved sector array holds one lease slot per host. Joining
//! read-write runs a single-register consensus round: read every slot,
//! propose `max_epoch + 1` into your own slot, flush, then re-read and
//! verify no other host reached the proposed epoch first. The host whose
//! slot holds the highest epoch is the leader; anyone else attempting a
//! read-write mount observes the lease and fails with `Fenced`.

use pbfs_dev::{DevIo, IoFlags};
use pbfs_error::{PbfsError, Result};
use pbfs_types::{read_le_u32, read_le_u64, ByteOffset, Epoch, HostId, Interrupt, MAX_HOSTS};
use std::time::Duration;
use tracing::{debug, info};

pub const FENCE_SLOT_MAGIC: u32 = 0x5042_464E; // "PBFN"
const SLOT_SIZE: usize = 32;

/// Default bound on one leadership acquisition.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// One host's lease slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceSlot {
    pub host_id: HostId,
    pub epoch: Epoch,
    /// Round counter, bumped on every proposal by this host.
    pub proposal: u64,
}

impl FenceSlot {
    fn serialize(&self, sector_size: usize) -> Vec<u8> {
        let mut buf = vec![0_u8; sector_size];
        buf[0..4].copy_from_slice(&FENCE_SLOT_MAGIC.to_le_bytes());
        // 4..8: crc, patched below.
        buf[8..12].copy_from_slice(&self.host_id.0.to_le_bytes());
        buf[12..16].copy_from_slice(&self.epoch.0.to_le_bytes());
        buf[16..24].copy_from_slice(&self.proposal.to_le_bytes());
        let crc = crc32c::crc32c(&buf[..SLOT_SIZE]);
        buf[4..8].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn deserialize(buf: &[u8]) -> Option<Self> {
        let magic = read_le_u32(buf, 0).ok()?;
        if magic != FENCE_SLOT_MAGIC {
            return None;
        }
        let stored_crc = read_le_u32(buf, 4).ok()?;
        let mut zeroed = buf.get(..SLOT_SIZE)?.to_vec();
        zeroed[4..8].fill(0);
        if crc32c::crc32c(&zeroed) != stored_crc {
            return None;
        }
        Some(Self {
            host_id: HostId(read_le_u32(buf, 8).ok()?),
            epoch: Epoch(read_le_u32(buf, 12).ok()?),
            proposal: read_le_u64(buf, 16).ok()?,
        })
    }
}

/// The fence slot array region.
#[derive(Debug, Clone, Copy)]
pub struct FenceRegion {
    pub off: u64,
    pub sector_size: u32,
}

impl FenceRegion {
    #[must_use]
    pub fn from_superblock(sb: &pbfs_ondisk::Superblock) -> Self {
        Self {
            off: sb.fence_off,
            sector_size: sb.geometry.sector_size(),
        }
    }

    fn slot_offset(&self, host: HostId) -> ByteOffset {
        ByteOffset(self.off + u64::from(host.0) * u64::from(self.sector_size))
    }
}

/// Read every lease slot. Slots that never held a lease (or were corrupted)
/// come back as `None`.
pub fn read_slots(
    ir: &Interrupt,
    dev: &dyn DevIo,
    region: FenceRegion,
) -> Result<Vec<Option<FenceSlot>>> {
    ir.checkpoint().map_err(PbfsError::from)?;
    let sector = region.sector_size as usize;
    let mut raw = vec![0_u8; sector * MAX_HOSTS as usize];
    dev.pread(ir, &mut raw, ByteOffset(region.off), IoFlags::empty())?;
    Ok((0..MAX_HOSTS as usize)
        .map(|i| FenceSlot::deserialize(&raw[i * sector..(i + 1) * sector]))
        .collect())
}

/// The slot currently holding the highest epoch, if any.
pub fn observe_leader(
    ir: &Interrupt,
    dev: &dyn DevIo,
    region: FenceRegion,
) -> Result<Option<FenceSlot>> {
    let slots = read_slots(ir, dev, region)?;
    Ok(slots
        .into_iter()
        .flatten()
        .max_by_key(|slot| (slot.epoch, slot.proposal)))
}

/// Run a leadership round for `host`.
///
/// With `force` unset, an existing lease held by a *different* host wins
/// immediately (`Fenced`); `force` is the remount/auto-increase-epoch path
/// that usurps by proposing over it. On success the new epoch is durable in
/// this host's slot and strictly greater than every epoch observed.
pub fn acquire_leadership(
    ir: &Interrupt,
    dev: &dyn DevIo,
    region: FenceRegion,
    host: HostId,
    force: bool,
    timeout: Duration,
) -> Result<Epoch> {
    if host.0 >= MAX_HOSTS {
        return Err(PbfsError::Invalid(format!(
            "host id {} out of range (max {MAX_HOSTS})",
            host.0
        )));
    }
    let ir = ir.with_deadline(timeout);

    loop {
        ir.checkpoint().map_err(PbfsError::from)?;
        let slots = read_slots(&ir, dev, region)?;
        let incumbent = slots
            .iter()
            .flatten()
            .max_by_key(|slot| (slot.epoch, slot.proposal))
            .copied();

        if let Some(leader) = incumbent {
            if leader.host_id != host && !force {
                debug!(
                    target: "pbfs::fence",
                    event = "lease_observed",
                    leader = leader.host_id.0,
                    epoch = leader.epoch.0
                );
                return Err(PbfsError::Fenced(format!(
                    "host {} holds the lease at epoch {}",
                    leader.host_id.0, leader.epoch.0
                )));
            }
        }

        let max_epoch = incumbent.map_or(0, |slot| slot.epoch.0);
        let my_prior = slots[host.0 as usize];
        let proposal = my_prior.map_or(1, |slot| slot.proposal + 1);
        let candidate = Epoch(max_epoch + 1);

        let slot = FenceSlot {
            host_id: host,
            epoch: candidate,
            proposal,
        };
        let bytes = slot.serialize(region.sector_size as usize);
        dev.pwrite(
            &ir,
            Some(&bytes),
            region.slot_offset(host),
            bytes.len(),
            IoFlags::empty(),
        )?;
        dev.flush(&ir)?;

        // Verify: did anyone else reach our epoch concurrently?
        let verify = read_slots(&ir, dev, region)?;
        let contested = verify
            .iter()
            .flatten()
            .any(|other| other.host_id != host && other.epoch >= candidate);
        if contested {
            if !force {
                return Err(PbfsError::Fenced(format!(
                    "lost leadership round at epoch {}",
                    candidate.0
                )));
            }
            // Forced usurp: go around and outbid.
            continue;
        }

        info!(
            target: "pbfs::fence",
            event = "leadership_acquired",
            host = host.0,
            epoch = candidate.0,
            proposal
        );
        return Ok(candidate);
    }
}

/// Whether `host` still holds the lease at `epoch`.
///
/// A remote force-umount usurps the lease by winning a higher epoch; the
/// deposed leader sees that here and must fall back to read-only.
pub fn verify_leadership(
    ir: &Interrupt,
    dev: &dyn DevIo,
    region: FenceRegion,
    host: HostId,
    epoch: Epoch,
) -> Result<bool> {
    let leader = observe_leader(ir, dev, region)?;
    Ok(matches!(leader, Some(slot) if slot.host_id == host && slot.epoch == epoch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbfs_dev::RamDevice;

    fn region() -> FenceRegion {
        FenceRegion {
            off: 512,
            sector_size: 512,
        }
    }

    fn dev() -> RamDevice {
        RamDevice::new(512 * (MAX_HOSTS as usize + 1), 512)
    }

    #[test]
    fn first_host_acquires_epoch_one() {
        let dev = dev();
        let ir = Interrupt::none();
        let epoch =
            acquire_leadership(&ir, &dev, region(), HostId(1), false, Duration::from_secs(5))
                .expect("acquire");
        assert_eq!(epoch, Epoch(1));
        let leader = observe_leader(&ir, &dev, region()).expect("observe");
        assert_eq!(leader.map(|s| s.host_id), Some(HostId(1)));
    }

    #[test]
    fn second_host_is_fenced() {
        let dev = dev();
        let ir = Interrupt::none();
        acquire_leadership(&ir, &dev, region(), HostId(1), false, Duration::from_secs(5))
            .expect("acquire");
        let err =
            acquire_leadership(&ir, &dev, region(), HostId(2), false, Duration::from_secs(5))
                .expect_err("fenced");
        assert!(matches!(err, PbfsError::Fenced(_)));
    }

    #[test]
    fn forced_acquire_usurps() {
        let dev = dev();
        let ir = Interrupt::none();
        let first =
            acquire_leadership(&ir, &dev, region(), HostId(1), false, Duration::from_secs(5))
                .expect("acquire");
        let second =
            acquire_leadership(&ir, &dev, region(), HostId(2), true, Duration::from_secs(5))
                .expect("usurp");
        assert!(second > first);
        assert!(
            !verify_leadership(&ir, &dev, region(), HostId(1), first).expect("verify deposed")
        );
        assert!(verify_leadership(&ir, &dev, region(), HostId(2), second).expect("verify new"));
    }

    #[test]
    fn rejoin_same_host_bumps_epoch_and_proposal() {
        let dev = dev();
        let ir = Interrupt::none();
        let e1 = acquire_leadership(&ir, &dev, region(), HostId(3), false, Duration::from_secs(5))
            .expect("first");
        let e2 = acquire_leadership(&ir, &dev, region(), HostId(3), false, Duration::from_secs(5))
            .expect("second");
        assert!(e2 > e1);
        let slots = read_slots(&ir, &dev, region()).expect("slots");
        let slot = slots[3].expect("slot");
        assert_eq!(slot.proposal, 2);
    }

    #[test]
    fn corrupt_slot_reads_as_empty() {
        let dev = dev();
        let ir = Interrupt::none();
        acquire_leadership(&ir, &dev, region(), HostId(0), false, Duration::from_secs(5))
            .expect("acquire");
        // Smash the slot.
        dev.pwrite(
            &ir,
            Some(&[0xAB_u8; 512]),
            ByteOffset(512),
            512,
            IoFlags::empty(),
        )
        .expect("smash");
        let slots = read_slots(&ir, &dev, region()).expect("slots");
        assert!(slots[0].is_none());
    }

    #[test]
    fn out_of_range_host_rejected() {
        let dev = dev();
        let ir = Interrupt::none();
        assert!(matches!(
            acquire_leadership(
                &ir,
                &dev,
                region(),
                HostId(MAX_HOSTS),
                false,
                Duration::from_secs(1)
            ),
            Err(PbfsError::Invalid(_))
        ));
    }
}
