use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::dma_ctrl::BlockTransfer;
use super::transfer::{Endpoint, StridedRegion, HOST_MEMORY_NODE};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgramError {
  #[error("buffer ends at {len} while reading {needed} bytes at offset {offset}")]
  Truncated { offset: usize, needed: usize, len: usize },
  #[error("scratchpad endpoint at offset {offset} has window flag {value}, expected 1")]
  BadWindowFlag { offset: usize, value: u8 },
  #[error("{0} trailing bytes after the last transfer")]
  TrailingBytes(usize),
}

/// Which of the two fixed headers the buffer starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderKind {
  Program,
  Signature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Header {
  Program {
    computes: u16,
    transfers: u16,
    task_grain: u32,
    num_tasks: u32,
  },
  Signature {
    transfers: u8,
    computes: u8,
    skip_tasks: u32,
    num_tasks: u32,
  },
}

impl Header {
  pub fn computes(&self) -> usize {
    match *self {
      Header::Program { computes, .. } => computes as usize,
      Header::Signature { computes, .. } => computes as usize,
    }
  }

  pub fn transfers(&self) -> usize {
    match *self {
      Header::Program { transfers, .. } => transfers as usize,
      Header::Signature { transfers, .. } => transfers as usize,
    }
  }

  pub fn num_tasks(&self) -> u32 {
    match *self {
      Header::Program { num_tasks, .. } | Header::Signature { num_tasks, .. } => num_tasks,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeArg {
  pub base_addr: u32,
  pub sizes: Vec<u32>,
  pub strides: Vec<i32>,
  pub element_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compute {
  pub opcode: u32,
  pub spm_window_count: u32,
  pub spm_window_size: u32,
  pub args: Vec<ComputeArg>,
  pub registers: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpmWindow {
  pub count: u32,
  pub size: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "side", rename_all = "snake_case")]
pub enum TransferSide {
  Memory {
    addr: u64,
    block_sizes: Vec<u32>,
    block_strides: Vec<i32>,
    element_sizes: Vec<u32>,
    element_strides: Vec<i32>,
  },
  Scratchpad {
    node: u32,
    addr: u64,
    window: SpmWindow,
    sizes: Vec<u32>,
    strides: Vec<i32>,
  },
}

impl TransferSide {
  pub fn endpoint(&self) -> Endpoint {
    match self {
      TransferSide::Memory { .. } => Endpoint::Memory,
      TransferSide::Scratchpad { node, .. } => Endpoint::Scratchpad(*node),
    }
  }

  /// Flattened access pattern. For host memory the element dimensions are
  /// innermost, followed by the block dimensions.
  pub fn region(&self) -> StridedRegion {
    match self {
      TransferSide::Memory {
        addr,
        block_sizes,
        block_strides,
        element_sizes,
        element_strides,
      } => StridedRegion::new(
        *addr,
        element_sizes.iter().chain(block_sizes).copied().collect(),
        element_strides.iter().chain(block_strides).copied().collect(),
      ),
      TransferSide::Scratchpad { addr, sizes, strides, .. } => {
        StridedRegion::new(*addr, sizes.clone(), strides.clone())
      },
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDesc {
  pub src: TransferSide,
  pub dst: TransferSide,
  pub atom_size: u8,
}

impl TransferDesc {
  pub fn to_block_transfer(&self, priority: i32) -> BlockTransfer {
    let src = self.src.region();
    let dst = self.dst.region();
    BlockTransfer {
      src: self.src.endpoint(),
      src_addr: src.base,
      src_sizes: src.sizes,
      src_strides: src.strides,
      dst: self.dst.endpoint(),
      dst_addr: dst.base,
      dst_sizes: dst.sizes,
      dst_strides: dst.strides,
      element_size: self.atom_size as u32,
      priority,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Microprogram {
  pub header: Header,
  pub computes: Vec<Compute>,
  pub transfers: Vec<TransferDesc>,
}

impl Microprogram {
  pub fn block_transfers(&self) -> Vec<BlockTransfer> {
    self.transfers.iter().map(|t| t.to_block_transfer(0)).collect()
  }
}

/// Little-endian field reader over a program buffer.
struct Reader<'a> {
  buf: &'a [u8],
  pos: usize,
}

impl<'a> Reader<'a> {
  fn new(buf: &'a [u8]) -> Self {
    Self { buf, pos: 0 }
  }

  fn take<const N: usize>(&mut self) -> Result<[u8; N], ProgramError> {
    let end = self.pos + N;
    let bytes = self.buf.get(self.pos..end).ok_or(ProgramError::Truncated {
      offset: self.pos,
      needed: N,
      len: self.buf.len(),
    })?;
    self.pos = end;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
  }

  fn u8(&mut self) -> Result<u8, ProgramError> {
    Ok(self.take::<1>()?[0])
  }

  fn u16(&mut self) -> Result<u16, ProgramError> {
    Ok(u16::from_le_bytes(self.take()?))
  }

  fn u32(&mut self) -> Result<u32, ProgramError> {
    Ok(u32::from_le_bytes(self.take()?))
  }

  fn i32(&mut self) -> Result<i32, ProgramError> {
    Ok(i32::from_le_bytes(self.take()?))
  }

  fn u64(&mut self) -> Result<u64, ProgramError> {
    Ok(u64::from_le_bytes(self.take()?))
  }

  fn pairs(&mut self, dims: u8) -> Result<(Vec<u32>, Vec<i32>), ProgramError> {
    let mut sizes = Vec::with_capacity(dims as usize);
    let mut strides = Vec::with_capacity(dims as usize);
    for _ in 0..dims {
      sizes.push(self.u32()?);
      strides.push(self.i32()?);
    }
    Ok((sizes, strides))
  }

  fn remaining(&self) -> usize {
    self.buf.len() - self.pos
  }
}

/// Fixed part of one transfer side, read before either body.
struct SideHead {
  node: u32,
  addr: u64,
  a: u8,
  b: u8,
  offset: usize,
}

fn read_head(r: &mut Reader) -> Result<SideHead, ProgramError> {
  let offset = r.pos;
  let node = r.u32()?;
  let addr = r.u64()?;
  let a = r.u8()?;
  let b = r.u8()?;
  Ok(SideHead { node, addr, a, b, offset })
}

fn read_body(r: &mut Reader, head: &SideHead) -> Result<TransferSide, ProgramError> {
  if head.node == HOST_MEMORY_NODE {
    let (block_sizes, block_strides) = r.pairs(head.a)?;
    let (element_sizes, element_strides) = r.pairs(head.b)?;
    return Ok(TransferSide::Memory {
      addr: head.addr,
      block_sizes,
      block_strides,
      element_sizes,
      element_strides,
    });
  }
  if head.a != 1 {
    return Err(ProgramError::BadWindowFlag {
      offset: head.offset + 12,
      value: head.a,
    });
  }
  let window = SpmWindow {
    count: r.u32()?,
    size: r.i32()?,
  };
  let (sizes, strides) = r.pairs(head.b)?;
  Ok(TransferSide::Scratchpad {
    node: head.node,
    addr: head.addr,
    window,
    sizes,
    strides,
  })
}

fn read_compute(r: &mut Reader) -> Result<Compute, ProgramError> {
  let opcode = r.u32()?;
  let spm_window_count = r.u32()?;
  let spm_window_size = r.u32()?;
  let n_args = r.u8()?;
  let mut args = Vec::with_capacity(n_args as usize);
  for _ in 0..n_args {
    let base_addr = r.u32()?;
    let dims = r.u8()?;
    let (sizes, strides) = r.pairs(dims)?;
    let element_size = r.u32()?;
    args.push(ComputeArg {
      base_addr,
      sizes,
      strides,
      element_size,
    });
  }
  let n_regs = r.u8()?;
  let registers = (0..n_regs).map(|_| r.u64()).collect::<Result<Vec<_>, _>>()?;
  Ok(Compute {
    opcode,
    spm_window_count,
    spm_window_size,
    args,
    registers,
  })
}

fn read_transfer(r: &mut Reader) -> Result<TransferDesc, ProgramError> {
  let src_head = read_head(r)?;
  let dst_head = read_head(r)?;
  let src = read_body(r, &src_head)?;
  let dst = read_body(r, &dst_head)?;
  let atom_size = r.u8()?;
  Ok(TransferDesc { src, dst, atom_size })
}

/// Decodes a complete microprogram buffer. Every compute chunk precedes the
/// transfer chunks, and nothing may follow the last transfer.
pub fn decode(buf: &[u8], kind: HeaderKind) -> Result<Microprogram, ProgramError> {
  let mut r = Reader::new(buf);
  let header = match kind {
    HeaderKind::Program => Header::Program {
      computes: r.u16()?,
      transfers: r.u16()?,
      task_grain: r.u32()?,
      num_tasks: r.u32()?,
    },
    HeaderKind::Signature => Header::Signature {
      transfers: r.u8()?,
      computes: r.u8()?,
      skip_tasks: r.u32()?,
      num_tasks: r.u32()?,
    },
  };

  let computes = (0..header.computes())
    .map(|_| read_compute(&mut r))
    .collect::<Result<Vec<_>, _>>()?;
  let transfers = (0..header.transfers())
    .map(|_| read_transfer(&mut r))
    .collect::<Result<Vec<_>, _>>()?;

  if r.remaining() != 0 {
    return Err(ProgramError::TrailingBytes(r.remaining()));
  }
  Ok(Microprogram {
    header,
    computes,
    transfers,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Byte builder laying fields out the way the encoder does.
  #[derive(Default)]
  struct Bytes(Vec<u8>);

  impl Bytes {
    fn u8(mut self, v: u8) -> Self {
      self.0.push(v);
      self
    }
    fn u16(mut self, v: u16) -> Self {
      self.0.extend_from_slice(&v.to_le_bytes());
      self
    }
    fn u32(mut self, v: u32) -> Self {
      self.0.extend_from_slice(&v.to_le_bytes());
      self
    }
    fn i32(mut self, v: i32) -> Self {
      self.0.extend_from_slice(&v.to_le_bytes());
      self
    }
    fn u64(mut self, v: u64) -> Self {
      self.0.extend_from_slice(&v.to_le_bytes());
      self
    }
    fn pair(self, size: u32, stride: i32) -> Self {
      self.u32(size).i32(stride)
    }
  }

  fn one_compute(b: Bytes) -> Bytes {
    b.u32(7) // opcode
      .u32(2)
      .u32(256)
      .u8(1)
      .u32(0x40)
      .u8(1)
      .pair(16, 1)
      .u32(4)
      .u8(2)
      .u64(0xdead)
      .u64(3)
  }

  #[test]
  fn decodes_memory_to_scratchpad_program() {
    let b = Bytes::default().u16(1).u16(1).u32(8).u32(32);
    let b = one_compute(b)
      // src head: memory, 2 block dims, 1 element dim
      .u32(HOST_MEMORY_NODE)
      .u64(0x10_0000)
      .u8(2)
      .u8(1)
      // dst head: scratchpad node 5
      .u32(5)
      .u64(0x80)
      .u8(1)
      .u8(1)
      // src body
      .pair(4, 64)
      .pair(2, 1024)
      .pair(16, 1)
      // dst body
      .u32(2)
      .i32(256)
      .pair(128, 1)
      .u8(4);

    let prog = decode(&b.0, HeaderKind::Program).unwrap();
    assert_eq!(
      prog.header,
      Header::Program {
        computes: 1,
        transfers: 1,
        task_grain: 8,
        num_tasks: 32
      }
    );
    assert_eq!(prog.computes[0].opcode, 7);
    assert_eq!(prog.computes[0].args[0].sizes, vec![16]);
    assert_eq!(prog.computes[0].registers, vec![0xdead, 3]);

    let t = &prog.transfers[0];
    assert_eq!(t.atom_size, 4);
    let block = t.to_block_transfer(0);
    assert_eq!(block.src, Endpoint::Memory);
    assert_eq!(block.src_sizes, vec![16, 4, 2]);
    assert_eq!(block.src_strides, vec![1, 64, 1024]);
    assert_eq!(block.dst, Endpoint::Scratchpad(5));
    assert_eq!(block.dst_sizes, vec![128]);
    assert_eq!(block.element_size, 4);
  }

  #[test]
  fn decodes_signature_with_scratchpad_pair() {
    let b = Bytes::default().u8(1).u8(0).u32(2).u32(10);
    let b = b
      .u32(1)
      .u64(0)
      .u8(1)
      .u8(1)
      .u32(2)
      .u64(0x100)
      .u8(1)
      .u8(2)
      .u32(1)
      .i32(64)
      .pair(8, -1)
      .u32(1)
      .i32(64)
      .pair(4, 1)
      .pair(2, 4)
      .u8(8);

    let prog = decode(&b.0, HeaderKind::Signature).unwrap();
    assert_eq!(prog.header.num_tasks(), 10);
    assert!(prog.computes.is_empty());
    match &prog.transfers[0].src {
      TransferSide::Scratchpad { node, strides, .. } => {
        assert_eq!(*node, 1);
        assert_eq!(strides, &vec![-1]);
      },
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(prog.transfers[0].dst.region().sizes, vec![4, 2]);
  }

  #[test]
  fn scratchpad_to_memory_keeps_side_order() {
    let b = Bytes::default().u16(0).u16(1).u32(0).u32(1);
    let b = b
      .u32(3)
      .u64(0)
      .u8(1)
      .u8(1)
      .u32(HOST_MEMORY_NODE)
      .u64(0x2000)
      .u8(1)
      .u8(0)
      .u32(1)
      .i32(16)
      .pair(16, 1)
      .pair(16, 1)
      .u8(4);
    let prog = decode(&b.0, HeaderKind::Program).unwrap();
    let block = prog.block_transfers().remove(0);
    assert_eq!(block.src, Endpoint::Scratchpad(3));
    assert_eq!(block.dst, Endpoint::Memory);
    assert_eq!(block.dst_addr, 0x2000);
    assert_eq!(block.dst_sizes, vec![16]);
  }

  #[test]
  fn truncation_reports_offset() {
    let b = Bytes::default().u16(1).u16(0).u32(0).u32(0).u32(7);
    assert_eq!(
      decode(&b.0, HeaderKind::Program).unwrap_err(),
      ProgramError::Truncated {
        offset: 16,
        needed: 4,
        len: 16
      }
    );
  }

  #[test]
  fn rejects_bad_window_flag_and_trailing_bytes() {
    let b = Bytes::default()
      .u16(0)
      .u16(1)
      .u32(0)
      .u32(0)
      .u32(2)
      .u64(0)
      .u8(0)
      .u8(0)
      .u32(HOST_MEMORY_NODE)
      .u64(0)
      .u8(0)
      .u8(0);
    assert_eq!(
      decode(&b.0, HeaderKind::Program).unwrap_err(),
      ProgramError::BadWindowFlag { offset: 24, value: 0 }
    );

    let b = Bytes::default().u16(0).u16(0).u32(0).u32(0).u8(9);
    assert_eq!(decode(&b.0, HeaderKind::Program).unwrap_err(), ProgramError::TrailingBytes(1));
  }
}
