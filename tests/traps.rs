//! Precise trap delivery: page faults under SV39, delegation, misaligned
//! AMOs, environment calls and WFI wakeup.

mod common;

use common::{asm, load, machine, pte, Sv39Builder, RAM_BASE};
use rvmach::cpu::csr;
use rvmach::PrivilegeLevel;

const CODE_VA: u64 = 0x1000;
const DATA_VA: u64 = 0x2000;
const HANDLER_VA: u64 = 0x3000;

const CODE_PA: u64 = RAM_BASE + 0x10_0000;
const DATA_PA: u64 = RAM_BASE + 0x10_1000;
const HANDLER_PA: u64 = RAM_BASE + 0x10_2000;

#[test]
fn store_page_fault_delegated_to_supervisor() {
    let (m, mut harts) = machine(1, true);
    let hart = &mut harts[0];

    let mut tables = Sv39Builder::new(&m, RAM_BASE + 0x20_0000);
    // User code page, user read-only data page, supervisor handler page.
    tables.map(&m, CODE_VA, CODE_PA, pte::X | pte::R | pte::U | pte::A);
    tables.map(&m, DATA_VA, DATA_PA, pte::R | pte::U | pte::A | pte::D);
    tables.map(&m, HANDLER_VA, HANDLER_PA, pte::X | pte::R | pte::A);

    // sw x1, 0(t0) with t0 = DATA_VA: faults on the missing W bit.
    load(&m, CODE_PA, &[asm::sw(1, 5, 0), asm::halt()]);
    load(&m, HANDLER_PA, &[asm::halt()]);

    hart.csr.satp = tables.satp();
    hart.csr.medeleg = 1 << 15;
    hart.csr.stvec = HANDLER_VA;
    hart.regs[5] = DATA_VA;
    hart.pc = CODE_VA;
    hart.set_priv(PrivilegeLevel::User);

    hart.run_steps(3);

    assert_eq!(hart.csr.scause, 15, "scause = store/AMO page fault");
    assert_eq!(hart.csr.stval, DATA_VA);
    assert_eq!(hart.csr.sepc, CODE_VA);
    assert_eq!(hart.priv_level, PrivilegeLevel::Supervisor);
    assert_eq!(hart.pc, HANDLER_VA);
}

#[test]
fn fetch_straddling_nonexecutable_page_faults_on_second_half() {
    let (m, mut harts) = machine(1, true);
    let hart = &mut harts[0];

    let mut tables = Sv39Builder::new(&m, RAM_BASE + 0x20_0000);
    tables.map(&m, CODE_VA, CODE_PA, pte::X | pte::R | pte::A);
    // DATA_VA (== CODE_VA + 0x1000) is mapped but not executable.
    tables.map(&m, DATA_VA, DATA_PA, pte::R | pte::A);
    tables.map(&m, HANDLER_VA, HANDLER_PA, pte::X | pte::R | pte::A);

    // A 4-byte instruction whose low half sits in the last two bytes of
    // the executable page.
    let inst = asm::addi(1, 0, 1).to_le_bytes();
    m.ram_write(CODE_PA + 0xFFE, &inst[..2]).unwrap();
    m.ram_write(DATA_PA, &inst[2..]).unwrap();
    load(&m, HANDLER_PA, &[asm::halt()]);

    hart.csr.satp = tables.satp();
    hart.csr.medeleg = 1 << 12;
    hart.csr.stvec = HANDLER_VA;
    hart.pc = CODE_VA + 0xFFE;
    hart.set_priv(PrivilegeLevel::Supervisor);

    hart.run_steps(3);

    assert_eq!(hart.csr.scause, 12, "scause = instruction page fault");
    assert_eq!(hart.csr.stval, DATA_VA, "fault reported on the second half");
    assert_eq!(hart.csr.sepc, CODE_VA + 0xFFE);
}

#[test]
fn misaligned_amo_is_a_store_misaligned_fault() {
    let (m, mut harts) = machine(1, false);
    let hart = &mut harts[0];

    let handler = RAM_BASE + 0x100;
    load(&m, RAM_BASE, &[asm::amoadd_w(6, 7, 5), asm::halt()]);
    load(&m, handler, &[asm::halt()]);
    hart.csr.mtvec = handler;
    hart.regs[5] = RAM_BASE + 0x2002; // misaligned by 2
    hart.regs[7] = 1;

    hart.run_steps(2);

    assert_eq!(hart.csr.mcause, 6, "misaligned AMO, not a load fault");
    assert_eq!(hart.csr.mtval, RAM_BASE + 0x2002);
    assert_eq!(hart.csr.mepc, RAM_BASE);
    assert_eq!(hart.pc, handler);
}

#[test]
fn ecall_cause_tracks_privilege() {
    let (m, mut harts) = machine(1, false);
    let hart = &mut harts[0];
    let handler = RAM_BASE + 0x100;
    load(&m, RAM_BASE, &[asm::ecall(), asm::halt()]);
    load(&m, handler, &[asm::halt()]);
    hart.csr.mtvec = handler;

    hart.run_steps(2);
    assert_eq!(hart.csr.mcause, 11, "ecall from M");
    assert_eq!(hart.csr.mepc, RAM_BASE);

    // mret returns to U (MPP left at 0) and the next ecall is cause 8.
    let (m, mut harts) = machine(1, false);
    let hart = &mut harts[0];
    load(&m, RAM_BASE, &[asm::mret(), asm::halt()]);
    load(&m, handler, &[asm::ecall(), asm::halt()]);
    hart.csr.mtvec = RAM_BASE + 0x200;
    load(&m, RAM_BASE + 0x200, &[asm::halt()]);
    hart.csr.mepc = handler;
    hart.run_steps(3);
    assert_eq!(hart.priv_level, PrivilegeLevel::Machine, "trapped back to M");
    assert_eq!(hart.csr.mcause, 8, "ecall from U");
}

#[test]
fn wfi_parks_until_interrupt() {
    let (m, mut harts) = machine(1, false);
    let hart = &mut harts[0];
    let handler = RAM_BASE + 0x100;
    load(&m, RAM_BASE, &[0x1050_0073 /* wfi */, asm::halt()]);
    load(&m, handler, &[asm::halt()]);
    hart.csr.mtvec = handler;
    hart.csr.mie = csr::MIP_MTIP;
    hart.csr.mstatus |= csr::MSTATUS_MIE;

    hart.run_steps(1);
    assert_eq!(hart.state, rvmach::RunState::WaitingForInterrupt);

    m.intc.irq_raise(0, csr::MIP_MTIP);
    hart.run_steps(2);

    assert_eq!(hart.csr.mcause & 0xFF, 7, "machine timer interrupt");
    assert!(hart.csr.mcause >> 63 == 1, "interrupt bit set");
    assert_eq!(hart.csr.mepc, RAM_BASE + 4, "resumes after the wfi");
    assert_eq!(hart.pc, handler);
    assert_eq!(hart.state, rvmach::RunState::Running);
}

#[test]
fn csr_instructions_roundtrip() {
    let (m, mut harts) = machine(1, false);
    let hart = &mut harts[0];
    // csrrw x6, mscratch, t0 ; csrrs x7, mscratch, x0 ; halt
    load(
        &m,
        RAM_BASE,
        &[
            asm::csrrw(6, 0x340, 5),
            asm::csrrs(7, 0x340, 0),
            asm::halt(),
        ],
    );
    hart.regs[5] = 0xABCD_EF01;
    hart.run_steps(3);
    assert_eq!(hart.regs[6], 0, "old mscratch");
    assert_eq!(hart.csr.mscratch, 0xABCD_EF01);
    assert_eq!(hart.regs[7], 0xABCD_EF01);
}
