//! The single CPU of a cooperative kernel.
//!
//! A ticket lock: whoever holds the current ticket runs, everyone else waits
//! in arrival order. A task gives the CPU up only when it blocks, sleeps or
//! yields.

use std::sync::{Condvar, Mutex, PoisonError};

#[derive(Default)]
struct Tickets {
    next: u64,
    serving: u64,
}

#[derive(Default)]
pub(crate) struct Cpu {
    tickets: Mutex<Tickets>,
    turn: Condvar,
}

impl Cpu {
    /// Block until the caller owns the CPU.
    pub(crate) fn acquire(&self) {
        let mut tickets = self.tickets.lock().unwrap_or_else(PoisonError::into_inner);
        let ticket = tickets.next;
        tickets.next += 1;
        while tickets.serving != ticket {
            tickets = self
                .turn
                .wait(tickets)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Hand the CPU to the next waiter. The caller must own it.
    pub(crate) fn release(&self) {
        let mut tickets = self.tickets.lock().unwrap_or_else(PoisonError::into_inner);
        tickets.serving += 1;
        self.turn.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_uncontended() {
        let cpu = Cpu::default();
        cpu.acquire();
        cpu.release();
        cpu.acquire();
        cpu.release();

        let tickets = cpu.tickets.lock().unwrap();
        assert_eq!(tickets.next, tickets.serving);
    }

    #[test]
    fn test_one_holder_at_a_time() {
        let cpu = Arc::new(Cpu::default());
        let counter = Arc::new(AtomicU32::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let cpu = cpu.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        cpu.acquire();
                        // Unsynchronized read-modify-write, made safe by the CPU.
                        let value = counter.load(Ordering::Relaxed);
                        thread::sleep(Duration::from_micros(50));
                        counter.store(value + 1, Ordering::Relaxed);
                        cpu.release();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 40);
    }
}
