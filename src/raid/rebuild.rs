use log::info;

use super::geometry::{Positions, RaidGeometry};
use super::parity;
use super::row::{invalidated_position, seal_position, ChunkRow, KeySel, PositionEpoch, RowKeys};
use super::stripe_io::StripeIo;
use crate::block_device::{shared_buffer, BLOCK_SIZE};
use crate::{rekey_error, Result};

/// Rewrites every chunk of `position` from the surviving positions.
///
/// `key_for` names the key each chunk is stored under, so a rebuild that
/// runs while a rekey is paused writes rekeyed chunks with the new key and
/// the rest with the old one. The position is marked rebuilding for the
/// duration and healthy once every chunk is back.
pub fn rebuild_position<'k>(
    io: &mut StripeIo,
    geometry: &RaidGeometry,
    position: usize,
    key_for: impl Fn(u64) -> KeySel<'k>,
) -> Result<()> {
    info!("Rebuilding stripe position {position}");
    io.health().mark_rebuilding(position);
    for chunk in 0..geometry.chunk_count {
        rebuild_chunk(io, geometry, position, chunk, key_for(chunk))?;
    }
    io.health().mark_healthy(position);
    info!("Rebuild of stripe position {position} finished");
    Ok(())
}

fn rebuild_chunk(
    io: &mut StripeIo,
    geometry: &RaidGeometry,
    position: usize,
    chunk: u64,
    key: KeySel,
) -> Result<()> {
    let row = ChunkRow::read(io, geometry, chunk, RowKeys::single(key))?;
    let readable = row.positions_where(|e| e.is_readable());
    let buf = if readable
        .iter()
        .any(|p| row.epoch(*p) == PositionEpoch::Invalidated)
    {
        invalidated_position(row.sectors)
    } else if readable.iter().all(|p| row.epoch(*p) == PositionEpoch::Zeroed) {
        shared_buffer(BLOCK_SIZE, row.sectors as usize)
    } else {
        let usable = |e: PositionEpoch| matches!(e, PositionEpoch::NewKey | PositionEpoch::Zeroed);
        let missing: Positions = row.positions_where(|e| !usable(e));
        let mut cols = row.columns(usable);
        if !parity::reconstruct(&geometry.layout(chunk), &mut cols, &missing) {
            return Err(rekey_error!(UnresolvableChunk {
                chunk,
                reason: format!("cannot rebuild position {position} with {missing:?} unusable"),
            }));
        }
        let Some(plaintext) = cols[position].take() else {
            return Err(rekey_error!(UnresolvableChunk {
                chunk,
                reason: format!("reconstruction left position {position} empty"),
            }));
        };
        seal_position(&plaintext, row.first_lba, key)
    };
    if !io.write(position, row.first_lba, buf)? {
        return Err(rekey_error!(PositionFailed {
            position,
            description: format!("write of chunk {chunk} failed during rebuild"),
        }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::{BlockDevice, MemBlockDevice, SECTOR_SIZE};
    use crate::config::RekeyConfig;
    use crate::crypt::XtsBlockCipher;
    use crate::raid::{PositionHealth, RaidType};

    fn write_row(io: &mut StripeIo, geometry: &RaidGeometry, chunk: u64, key: KeySel, fill: u8) {
        let size = geometry.chunk_sectors as usize * SECTOR_SIZE;
        let mut cols: parity::Columns = vec![None; geometry.width];
        for column in 0..geometry.data_columns() {
            let pos = geometry.column_positions(chunk, column)[0];
            cols[pos] = Some(vec![fill.wrapping_add(column as u8); size]);
        }
        parity::fill_redundancy(&geometry.layout(chunk), &mut cols);
        for (pos, col) in cols.iter().enumerate() {
            let buf = seal_position(col.as_ref().unwrap(), geometry.chunk_lba(chunk), key);
            assert!(io.write(pos, geometry.chunk_lba(chunk), buf).unwrap());
        }
    }

    #[test]
    fn test_rebuild_uses_per_chunk_key() {
        let geometry = RaidGeometry::new(RaidType::Raid5, 4, 2, 4).unwrap();
        let mems: Vec<MemBlockDevice> = (0..4).map(|_| MemBlockDevice::new(8)).collect();
        let devices: Vec<Box<dyn BlockDevice>> = mems.iter().map(|m| BlockDevice::clone(m)).collect();
        let health = PositionHealth::new(4);
        let mut io = StripeIo::new(&devices, health.clone(), &RekeyConfig::default()).unwrap();

        let old = XtsBlockCipher::new([1u8; 32], [2u8; 32]).unwrap();
        let new = XtsBlockCipher::new([3u8; 32], [4u8; 32]).unwrap();
        let key_for = |chunk: u64| if chunk < 2 { Some(&new) } else { Some(&old) };
        for chunk in 0..4 {
            write_row(&mut io, &geometry, chunk, key_for(chunk), chunk as u8 * 16);
        }
        let mut expected = vec![0u8; 8 * BLOCK_SIZE];
        mems[1].read(0, &mut expected);

        mems[1].write(0, &vec![0xAAu8; 8 * BLOCK_SIZE]);
        health.mark_failed(1);
        rebuild_position(&mut io, &geometry, 1, key_for).unwrap();

        let mut rebuilt = vec![0u8; 8 * BLOCK_SIZE];
        mems[1].read(0, &mut rebuilt);
        assert_eq!(rebuilt, expected);
        assert_eq!(health.degraded_count(), 0);
    }

    #[test]
    fn test_rebuild_fails_without_redundancy() {
        let geometry = RaidGeometry::new(RaidType::Raid5, 3, 1, 1).unwrap();
        let devices: Vec<Box<dyn BlockDevice>> = (0..3)
            .map(|_| Box::new(MemBlockDevice::new(1)) as Box<dyn BlockDevice>)
            .collect();
        let health = PositionHealth::new(3);
        let mut io = StripeIo::new(&devices, health.clone(), &RekeyConfig::default()).unwrap();
        let key = XtsBlockCipher::new([1u8; 32], [2u8; 32]).unwrap();
        write_row(&mut io, &geometry, 0, Some(&key), 3);
        health.mark_failed(0);
        health.mark_failed(2);
        assert!(rebuild_position(&mut io, &geometry, 0, |_| Some(&key)).is_err());
    }
}
