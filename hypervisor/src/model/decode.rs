// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder for the x86 instruction subset the harness assembles.

/// Default operand size of the current code segment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperandSize {
    /// 16-bit code, as run by SMI handlers.
    Word,
    /// 32-bit or 64-bit code without REX.W.
    Dword,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    /// `mov r, imm`; `imm` is zero-extended to the operand size.
    MovImm { reg: u8, imm: u32, size: u8 },
    MovAlImm(u8),
    OutImm8Al(u8),
    Rdmsr,
    Wrmsr,
    /// `mov r/m, r` between registers.
    MovRegReg { dst: u8, src: u8, size: u8 },
    /// `or eax, imm32`, or with `wide` set, `or rax, imm32` sign extended.
    OrAccImm { imm: u32, wide: bool },
    XorRegReg { dst: u8, src: u8, size: u8 },
    MovFromCr { cr: u8, reg: u8 },
    MovToCr { cr: u8, reg: u8 },
    Hlt,
    JmpRel8(i8),
    Rsm,
}

/// Why `decode` gave up.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// The bytes ran out in the middle of an instruction.
    Truncated,
    /// Not an instruction this decoder knows.
    Unsupported(u8),
}

/// Register to register operands of a ModRM byte, if it encodes them.
fn modrm_regs(modrm: u8) -> Option<(u8, u8)> {
    if modrm >> 6 != 0b11 {
        return None;
    }
    Some(((modrm >> 3) & 7, modrm & 7))
}

fn imm32(bytes: &[u8], at: usize) -> Result<u32, DecodeError> {
    let b = bytes.get(at..at + 4).ok_or(DecodeError::Truncated)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn imm16(bytes: &[u8], at: usize) -> Result<u32, DecodeError> {
    let b = bytes.get(at..at + 2).ok_or(DecodeError::Truncated)?;
    Ok(u32::from(u16::from_le_bytes([b[0], b[1]])))
}

fn byte(bytes: &[u8], at: usize) -> Result<u8, DecodeError> {
    bytes.get(at).copied().ok_or(DecodeError::Truncated)
}

/// Decodes the instruction at the start of `bytes`, returning it with its length.
///
/// `long_mode` enables the REX.W prefix, which is only meaningful in 64-bit code.
pub fn decode(
    bytes: &[u8],
    size: OperandSize,
    long_mode: bool,
) -> Result<(Instruction, usize), DecodeError> {
    let opsize = match size {
        OperandSize::Word => 2,
        OperandSize::Dword => 4,
    };
    let op = byte(bytes, 0)?;
    match op {
        0x48 if long_mode => match byte(bytes, 1)? {
            0x0d => Ok((
                Instruction::OrAccImm {
                    imm: imm32(bytes, 2)?,
                    wide: true,
                },
                6,
            )),
            other => Err(DecodeError::Unsupported(other)),
        },
        0xb8..=0xbf => {
            let reg = op - 0xb8;
            if opsize == 4 {
                Ok((
                    Instruction::MovImm {
                        reg,
                        imm: imm32(bytes, 1)?,
                        size: 4,
                    },
                    5,
                ))
            } else {
                Ok((
                    Instruction::MovImm {
                        reg,
                        imm: imm16(bytes, 1)?,
                        size: 2,
                    },
                    3,
                ))
            }
        }
        0xb0 => Ok((Instruction::MovAlImm(byte(bytes, 1)?), 2)),
        0xe6 => Ok((Instruction::OutImm8Al(byte(bytes, 1)?), 2)),
        0x89 | 0x31 => {
            let modrm = byte(bytes, 1)?;
            let (src, dst) = modrm_regs(modrm).ok_or(DecodeError::Unsupported(op))?;
            let insn = if op == 0x89 {
                Instruction::MovRegReg {
                    dst,
                    src,
                    size: opsize,
                }
            } else {
                Instruction::XorRegReg {
                    dst,
                    src,
                    size: opsize,
                }
            };
            Ok((insn, 2))
        }
        0x0d if opsize == 4 => Ok((
            Instruction::OrAccImm {
                imm: imm32(bytes, 1)?,
                wide: false,
            },
            5,
        )),
        0xf4 => Ok((Instruction::Hlt, 1)),
        0xeb => Ok((Instruction::JmpRel8(byte(bytes, 1)? as i8), 2)),
        0x0f => match byte(bytes, 1)? {
            0x30 => Ok((Instruction::Wrmsr, 2)),
            0x32 => Ok((Instruction::Rdmsr, 2)),
            0xaa => Ok((Instruction::Rsm, 2)),
            op2 @ (0x20 | 0x22) => {
                let modrm = byte(bytes, 2)?;
                let (cr, reg) = modrm_regs(modrm).ok_or(DecodeError::Unsupported(op2))?;
                let insn = if op2 == 0x20 {
                    Instruction::MovFromCr { cr, reg }
                } else {
                    Instruction::MovToCr { cr, reg }
                };
                Ok((insn, 3))
            }
            other => Err(DecodeError::Unsupported(other)),
        },
        other => Err(DecodeError::Unsupported(other)),
    }
}
