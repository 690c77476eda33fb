//! Type aliases for RDMA-related identifiers.

/// [`u8`]: **Port number**, identifies a port on an HCA.
pub type PortNum = u8;

/// [`u16`]: **Local identifier (LID)**, the subnet-local address of a port.
pub type Lid = u16;

/// [`u8`]: **Global identifier (GID) index**, selects an entry of a port's GID table.
pub type GidIndex = u8;

/// [`u32`]: **Queue pair number**, 24 significant bits.
pub type Qpn = u32;

/// [`u32`]: **Packet sequence number (PSN)**, 24 significant bits.
pub type Psn = u32;

/// [`u32`]: **Local key**, identifies a local memory region.
pub type LKey = u32;

/// [`u32`]: **Remote key**, grants a peer access to a memory region.
pub type RKey = u32;

/// [`u64`]: **Work request identifier**, designated by the user to identify a work request.
pub type WrId = u64;

/// [`u32`]: **Immediate data**, carried by RDMA writes with immediate.
pub type ImmData = u32;

/// Mask of the 24-bit QPN and PSN spaces.
pub const MASK_24: u32 = 0x00ff_ffff;
