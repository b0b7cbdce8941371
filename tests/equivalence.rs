//! Interpreter/JIT equivalence on randomized straight-line sequences.
//!
//! The same program runs from the same architectural state on two
//! machines, one with the JIT forced hot and one interpreter-only; the
//! resulting register files, PC and touched memory must be identical.

mod common;

use common::{asm, load, machine, RAM_BASE};
use rand::{Rng, SeedableRng};

const SCRATCH: u64 = RAM_BASE + 0x10_0000;

/// Emit one random ALU/memory instruction. x5 holds the scratch base and
/// is never clobbered; destinations come from x1..x4 and x6..x15.
fn random_inst(rng: &mut impl Rng) -> u32 {
    const DESTS: [u32; 14] = [1, 2, 3, 4, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];
    let rd = DESTS[rng.gen_range(0..DESTS.len())];
    let rs1 = rng.gen_range(0..16);
    let rs2 = rng.gen_range(0..16);
    match rng.gen_range(0..12) {
        0 => asm::addi(rd, rs1, rng.gen_range(-2048..2048)),
        1 => asm::add(rd, rs1, rs2),
        2 => asm::lui(rd, rng.gen_range(0..0x10_0000)),
        3 => asm::div(rd, rs1, rs2),
        4 => asm::rem(rd, rs1, rs2),
        // sub / sll / srl / sra / sltu via raw R-type encodings
        5 => (0b0100000 << 25) | (rs2 << 20) | (rs1 << 15) | (rd << 7) | 0b0110011,
        6 => (rs2 << 20) | (rs1 << 15) | (0b001 << 12) | (rd << 7) | 0b0110011,
        7 => (rs2 << 20) | (rs1 << 15) | (0b101 << 12) | (rd << 7) | 0b0110011,
        8 => (rs2 << 20) | (rs1 << 15) | (0b011 << 12) | (rd << 7) | 0b0110011,
        9 => {
            // mulh
            (1 << 25) | (rs2 << 20) | (rs1 << 15) | (0b001 << 12) | (rd << 7) | 0b0110011
        }
        10 => asm::lw(rd, 5, rng.gen_range(0..64) * 4),
        _ => asm::sd(rs2, 5, rng.gen_range(0..32) * 8),
    }
}

#[test]
fn randomized_alu_and_memory_sequences() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED_CAFE);

    for round in 0..24 {
        let len = rng.gen_range(4..48);
        let mut program: Vec<u32> = (0..len).map(|_| random_inst(&mut rng)).collect();
        program.push(asm::halt());

        let seed_regs: Vec<u64> = (0..32).map(|_| rng.gen()).collect();
        let scratch_seed: Vec<u8> = (0..512).map(|_| rng.gen()).collect();

        let run = |jit: bool| {
            let (m, mut harts) = machine(1, jit);
            load(&m, RAM_BASE, &program);
            m.ram_write(SCRATCH, &scratch_seed).unwrap();
            let hart = &mut harts[0];
            for (i, &v) in seed_regs.iter().enumerate().skip(1) {
                hart.regs[i] = v;
            }
            hart.regs[5] = SCRATCH;
            // One extra step for the terminal jump.
            hart.run_steps(len as u64 + 1);
            let mut mem = vec![0u8; 512];
            m.ram_read(SCRATCH, &mut mem);
            (hart.regs, hart.pc, mem)
        };

        let (jit_regs, jit_pc, jit_mem) = run(true);
        let (int_regs, int_pc, int_mem) = run(false);

        assert_eq!(jit_regs, int_regs, "register divergence in round {}", round);
        assert_eq!(jit_pc, int_pc, "pc divergence in round {}", round);
        assert_eq!(jit_mem, int_mem, "memory divergence in round {}", round);
    }
}

#[test]
fn x0_stays_zero_under_both_executors() {
    // Writes aimed at x0 through several instruction shapes.
    let program = [
        asm::addi(0, 1, 123),
        asm::add(0, 2, 3),
        asm::lui(0, 0xFFFFF),
        asm::lw(0, 5, 0),
        asm::halt(),
    ];
    for jit in [true, false] {
        let (m, mut harts) = machine(1, jit);
        load(&m, RAM_BASE, &program);
        m.ram_write(SCRATCH, &[0xAA; 8]).unwrap();
        let hart = &mut harts[0];
        hart.regs[1] = 7;
        hart.regs[2] = 8;
        hart.regs[3] = 9;
        hart.regs[5] = SCRATCH;
        hart.run_steps(5);
        assert_eq!(hart.regs[0], 0);
        assert_eq!(hart.read_reg(0), 0);
    }
}

#[test]
fn division_edge_cases_match() {
    // div/rem by zero and the signed-overflow pair, through both engines.
    let program = [
        asm::div(6, 1, 2),  // x1 / 0
        asm::rem(7, 1, 2),  // x1 % 0
        asm::div(8, 3, 4),  // i64::MIN / -1
        asm::rem(9, 3, 4),
        asm::halt(),
    ];
    for jit in [true, false] {
        let (m, mut harts) = machine(1, jit);
        load(&m, RAM_BASE, &program);
        let hart = &mut harts[0];
        hart.regs[1] = 42;
        hart.regs[2] = 0;
        hart.regs[3] = i64::MIN as u64;
        hart.regs[4] = -1i64 as u64;
        hart.run_steps(5);
        assert_eq!(hart.regs[6], u64::MAX, "div by zero returns -1");
        assert_eq!(hart.regs[7], 42, "rem by zero returns the dividend");
        assert_eq!(hart.regs[8], i64::MIN as u64);
        assert_eq!(hart.regs[9], 0);
    }
}
