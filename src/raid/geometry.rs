use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{rekey_error, Result};

/// Upper bound on raid group width; needs-rebuild masks are 16 bits wide.
pub const MAX_WIDTH: usize = 16;

pub type Positions = SmallVec<[usize; MAX_WIDTH]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaidType {
    Raid0,
    Raid1,
    Raid10,
    Raid3,
    Raid5,
    Raid6,
}

impl RaidType {
    fn min_width(self) -> usize {
        match self {
            RaidType::Raid0 => 1,
            RaidType::Raid1 => 2,
            RaidType::Raid10 => 4,
            RaidType::Raid3 | RaidType::Raid5 => 3,
            RaidType::Raid6 => 4,
        }
    }
}

impl std::fmt::Display for RaidType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RaidType::Raid0 => "RAID-0",
            RaidType::Raid1 => "RAID-1",
            RaidType::Raid10 => "RAID-10",
            RaidType::Raid3 => "RAID-3",
            RaidType::Raid5 => "RAID-5",
            RaidType::Raid6 => "RAID-6",
        };
        f.write_str(name)
    }
}

/// Where the columns of one chunk row live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowLayout {
    Striped { data: Positions },
    Mirrored { copies: Positions },
    StripedMirror { pairs: SmallVec<[[usize; 2]; MAX_WIDTH]> },
    Parity { data: Positions, p: usize },
    DualParity { data: Positions, p: usize, q: usize },
}

impl RowLayout {
    /// Whether the row can be fully recovered with `missing` positions gone.
    pub fn can_reconstruct(&self, missing: &[usize]) -> bool {
        match self {
            RowLayout::Striped { .. } => missing.is_empty(),
            RowLayout::Mirrored { copies } => copies.iter().any(|p| !missing.contains(p)),
            RowLayout::StripedMirror { pairs } => pairs
                .iter()
                .all(|pair| !(missing.contains(&pair[0]) && missing.contains(&pair[1]))),
            RowLayout::Parity { .. } => missing.len() <= 1,
            RowLayout::DualParity { .. } => missing.len() <= 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaidGeometry {
    pub raid_type: RaidType,
    pub width: usize,
    /// Sectors every position contributes to one chunk.
    pub chunk_sectors: u64,
    pub chunk_count: u64,
}

impl RaidGeometry {
    pub fn new(raid_type: RaidType, width: usize, chunk_sectors: u64, chunk_count: u64) -> Result<Self> {
        if width < raid_type.min_width() || width > MAX_WIDTH {
            return Err(rekey_error!(InvalidParameter {
                description: format!(
                    "{raid_type} width {width} is out of range (must be {}..={MAX_WIDTH})",
                    raid_type.min_width()
                ),
            }));
        }
        if raid_type == RaidType::Raid10 && width % 2 != 0 {
            return Err(rekey_error!(InvalidParameter {
                description: format!("{raid_type} width {width} must be even"),
            }));
        }
        if chunk_sectors == 0 || chunk_count == 0 {
            return Err(rekey_error!(InvalidParameter {
                description: "chunk_sectors and chunk_count must be non-zero".to_string(),
            }));
        }
        Ok(RaidGeometry {
            raid_type,
            width,
            chunk_sectors,
            chunk_count,
        })
    }

    /// Number of positions that may be lost without losing data.
    pub fn fault_tolerance(&self) -> usize {
        match self.raid_type {
            RaidType::Raid0 => 0,
            RaidType::Raid1 => self.width - 1,
            RaidType::Raid10 | RaidType::Raid3 | RaidType::Raid5 => 1,
            RaidType::Raid6 => 2,
        }
    }

    pub fn data_columns(&self) -> usize {
        match self.raid_type {
            RaidType::Raid0 => self.width,
            RaidType::Raid1 => 1,
            RaidType::Raid10 => self.width / 2,
            RaidType::Raid3 | RaidType::Raid5 => self.width - 1,
            RaidType::Raid6 => self.width - 2,
        }
    }

    /// Sectors each position needs to back every chunk.
    pub fn position_sectors(&self) -> u64 {
        self.chunk_count * self.chunk_sectors
    }

    pub fn logical_sectors_per_chunk(&self) -> u64 {
        self.data_columns() as u64 * self.chunk_sectors
    }

    pub fn logical_capacity(&self) -> u64 {
        self.chunk_count * self.logical_sectors_per_chunk()
    }

    pub fn chunk_lba(&self, chunk: u64) -> u64 {
        chunk * self.chunk_sectors
    }

    /// Maps a logical sector to `(chunk, data column, sector within column)`.
    pub fn locate(&self, logical: u64) -> (u64, usize, u64) {
        let per_chunk = self.logical_sectors_per_chunk();
        let chunk = logical / per_chunk;
        let within = logical % per_chunk;
        (
            chunk,
            (within / self.chunk_sectors) as usize,
            within % self.chunk_sectors,
        )
    }

    pub fn layout(&self, chunk: u64) -> RowLayout {
        let width = self.width;
        match self.raid_type {
            RaidType::Raid0 => RowLayout::Striped {
                data: (0..width).collect(),
            },
            RaidType::Raid1 => RowLayout::Mirrored {
                copies: (0..width).collect(),
            },
            RaidType::Raid10 => RowLayout::StripedMirror {
                pairs: (0..width / 2).map(|i| [2 * i, 2 * i + 1]).collect(),
            },
            RaidType::Raid3 => RowLayout::Parity {
                data: (0..width - 1).collect(),
                p: width - 1,
            },
            RaidType::Raid5 => {
                let p = width - 1 - (chunk % width as u64) as usize;
                RowLayout::Parity {
                    data: (1..width).map(|i| (p + i) % width).collect(),
                    p,
                }
            }
            RaidType::Raid6 => {
                let p = width - 1 - (chunk % width as u64) as usize;
                let q = (p + 1) % width;
                RowLayout::DualParity {
                    data: (2..width).map(|i| (p + i) % width).collect(),
                    p,
                    q,
                }
            }
        }
    }

    /// Positions holding the given data column of `chunk`.
    pub fn column_positions(&self, chunk: u64, column: usize) -> Positions {
        match self.layout(chunk) {
            RowLayout::Striped { data }
            | RowLayout::Parity { data, .. }
            | RowLayout::DualParity { data, .. } => SmallVec::from_slice(&[data[column]]),
            RowLayout::Mirrored { copies } => copies,
            RowLayout::StripedMirror { pairs } => SmallVec::from_slice(&pairs[column]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raid5_parity_rotates() {
        let geometry = RaidGeometry::new(RaidType::Raid5, 5, 4, 10).unwrap();
        let parity: Vec<usize> = (0..5)
            .map(|chunk| match geometry.layout(chunk) {
                RowLayout::Parity { p, data } => {
                    assert_eq!(data.len(), 4);
                    assert!(!data.contains(&p));
                    p
                }
                other => panic!("unexpected layout {other:?}"),
            })
            .collect();
        assert_eq!(parity, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn test_raid6_layout_uses_every_position_once() {
        let geometry = RaidGeometry::new(RaidType::Raid6, 6, 2, 12).unwrap();
        for chunk in 0..12 {
            let RowLayout::DualParity { data, p, q } = geometry.layout(chunk) else {
                panic!("expected dual parity");
            };
            let mut all: Vec<usize> = data.to_vec();
            all.push(p);
            all.push(q);
            all.sort();
            assert_eq!(all, (0..6).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_fault_tolerance_per_type() {
        let cases = [
            (RaidType::Raid0, 3, 0),
            (RaidType::Raid1, 2, 1),
            (RaidType::Raid1, 3, 2),
            (RaidType::Raid10, 4, 1),
            (RaidType::Raid3, 5, 1),
            (RaidType::Raid5, 5, 1),
            (RaidType::Raid6, 6, 2),
        ];
        for (raid_type, width, expected) in cases {
            let geometry = RaidGeometry::new(raid_type, width, 1, 1).unwrap();
            assert_eq!(geometry.fault_tolerance(), expected, "{raid_type}");
        }
    }

    #[test]
    fn test_can_reconstruct() {
        let raid10 = RaidGeometry::new(RaidType::Raid10, 4, 1, 1).unwrap().layout(0);
        assert!(raid10.can_reconstruct(&[0, 2]));
        assert!(!raid10.can_reconstruct(&[0, 1]));

        let raid6 = RaidGeometry::new(RaidType::Raid6, 5, 1, 1).unwrap().layout(0);
        assert!(raid6.can_reconstruct(&[1, 3]));
        assert!(!raid6.can_reconstruct(&[0, 1, 2]));

        let raid0 = RaidGeometry::new(RaidType::Raid0, 2, 1, 1).unwrap().layout(0);
        assert!(!raid0.can_reconstruct(&[1]));
    }

    #[test]
    fn test_locate_logical_sector() {
        let geometry = RaidGeometry::new(RaidType::Raid5, 4, 8, 4).unwrap();
        assert_eq!(geometry.logical_sectors_per_chunk(), 24);
        assert_eq!(geometry.locate(0), (0, 0, 0));
        assert_eq!(geometry.locate(9), (0, 1, 1));
        assert_eq!(geometry.locate(24 + 23), (1, 2, 7));
        assert_eq!(geometry.logical_capacity(), 96);
    }

    #[test]
    fn test_invalid_widths_rejected() {
        assert!(RaidGeometry::new(RaidType::Raid10, 5, 1, 1).is_err());
        assert!(RaidGeometry::new(RaidType::Raid6, 3, 1, 1).is_err());
        assert!(RaidGeometry::new(RaidType::Raid5, 17, 1, 1).is_err());
        assert!(RaidGeometry::new(RaidType::Raid1, 2, 0, 1).is_err());
    }
}
