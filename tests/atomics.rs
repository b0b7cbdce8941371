//! Multi-hart atomics: AMO counters and LR/SC spinlocks on real OS
//! threads racing on shared guest memory.

mod common;

use common::{asm, load, machine, RAM_BASE};

const ITERS: i32 = 50_000;

#[test]
fn amoadd_counter_is_exact() {
    let (m, harts) = machine(2, true);
    let counter = RAM_BASE + 0x2000;

    // t0 = iterations; t1 = 1; a0 = counter address
    // loop: amoadd.w x0, t1, (a0); addi t0, t0, -1; bne t0, x0, loop
    let program = [
        asm::amoadd_w(0, 6, 10),
        asm::addi(5, 5, -1),
        asm::bne(5, 0, -8),
        asm::halt(),
    ];
    load(&m, RAM_BASE, &program);
    m.mem.phys_write(counter, 4, 0).unwrap();

    let threads: Vec<_> = harts
        .into_iter()
        .map(|mut hart| {
            hart.regs[5] = ITERS as u64;
            hart.regs[6] = 1;
            hart.regs[10] = counter;
            std::thread::spawn(move || {
                hart.run_steps(4 * ITERS as u64 + 8);
                hart
            })
        })
        .collect();
    for t in threads {
        let hart = t.join().unwrap();
        assert_eq!(hart.regs[5], 0, "hart {} did not finish its loop", hart.id);
    }

    assert_eq!(m.mem.phys_read(counter, 4).unwrap(), 2 * ITERS as u64);
}

#[test]
fn lr_sc_spinlock_mutual_exclusion() {
    const HARTS: usize = 4;
    const PER_HART: i32 = 5_000;
    let (m, harts) = machine(HARTS, true);
    let lock_addr = RAM_BASE + 0x3000;
    let counter = RAM_BASE + 0x3100;

    // a0 = lock, a1 = counter, t0 = iterations, t2 = 1
    // acquire: lr.w   t1, (a0)
    //          bne    t1, x0, acquire
    //          sc.w   t1, t2, (a0)
    //          bne    t1, x0, acquire
    //          lw     t3, 0(a1)         ; critical section
    //          addi   t3, t3, 1
    //          sw     t3, 0(a1)
    //          sw     x0, 0(a0)         ; release
    //          addi   t0, t0, -1
    //          bne    t0, x0, acquire
    //          halt
    let program = [
        asm::lr_w(6, 10),
        asm::bne(6, 0, -4),
        asm::sc_w(6, 7, 10),
        asm::bne(6, 0, -12),
        asm::lw(28, 11, 0),
        asm::addi(28, 28, 1),
        asm::sw(28, 11, 0),
        asm::sw(0, 10, 0),
        asm::addi(5, 5, -1),
        asm::bne(5, 0, -36),
        asm::halt(),
    ];
    load(&m, RAM_BASE, &program);
    m.mem.phys_write(lock_addr, 4, 0).unwrap();
    m.mem.phys_write(counter, 4, 0).unwrap();

    let threads: Vec<_> = harts
        .into_iter()
        .map(|mut hart| {
            hart.regs[5] = PER_HART as u64;
            hart.regs[7] = 1;
            hart.regs[10] = lock_addr;
            hart.regs[11] = counter;
            std::thread::spawn(move || {
                // Contended acquires retry arbitrarily, so bound by time.
                let mut spent = 0u64;
                while hart.regs[5] != 0 && spent < 200_000_000 {
                    spent += hart.run_steps(100_000);
                }
                hart
            })
        })
        .collect();
    for t in threads {
        let hart = t.join().unwrap();
        assert_eq!(hart.regs[5], 0, "hart {} starved on the spinlock", hart.id);
    }

    assert_eq!(
        m.mem.phys_read(counter, 4).unwrap(),
        (HARTS as i32 * PER_HART) as u64,
        "lost updates imply two harts were inside the critical section"
    );
    assert_eq!(m.mem.phys_read(lock_addr, 4).unwrap(), 0, "lock left held");
}

#[test]
fn sc_fails_after_remote_store() {
    // Single-threaded interleaving via two harts driven by the test:
    // hart 0 takes a reservation, hart 1 stores into it, hart 0's SC
    // must fail and leave memory untouched.
    let (m, mut harts) = machine(2, false);
    let addr = RAM_BASE + 0x4000;
    m.mem.phys_write(addr, 4, 7).unwrap();

    // Hart 0, part 1: lr.w t1, (a0); halt
    load(&m, RAM_BASE, &[asm::lr_w(6, 10), asm::halt()]);
    harts[0].regs[10] = addr;
    harts[0].run_steps(1);
    assert_eq!(harts[0].regs[6], 7);

    // Hart 1: sw t2, (a0); halt
    load(&m, RAM_BASE + 0x100, &[asm::sw(7, 10, 0), asm::halt()]);
    harts[1].pc = RAM_BASE + 0x100;
    harts[1].regs[7] = 99;
    harts[1].regs[10] = addr;
    harts[1].run_steps(1);

    // Hart 0, part 2: sc.w t1, t2, (a0)
    load(&m, RAM_BASE + 0x200, &[asm::sc_w(6, 7, 10), asm::halt()]);
    harts[0].pc = RAM_BASE + 0x200;
    harts[0].regs[7] = 1234;
    harts[0].run_steps(1);

    assert_eq!(harts[0].regs[6], 1, "sc must fail after a foreign store");
    assert_eq!(m.mem.phys_read(addr, 4).unwrap(), 99);
}
