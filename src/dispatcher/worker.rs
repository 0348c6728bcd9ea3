//! One dispatcher worker thread: drains its `change_mask`, runs the stride
//! scheduler over its active slot set, and idles on a condvar when nothing
//! is runnable (spec.md §4.7).

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Dispatcher, Worker, ALPHA, T_MAX_SECS};

struct ActiveSlot {
    pass_value: f64,
    priority: f64,
    throughput: f64,
}

pub(super) fn worker_loop(id: usize, node: usize, dispatcher: Arc<Dispatcher>) {
    let worker = Worker { id, node };
    let mut active: HashMap<usize, ActiveSlot> = HashMap::new();
    let mut global_pass = 0.0f64;
    let mut sum_priorities = 0.0f64;
    // `engaged_mask`/`done_mask` are indexed by worker id in a single 64-bit
    // word (Dispatcher::new caps num_workers at 64); `change_mask` is a
    // separate, 128-bit-wide bitmask indexed by job *slot*.
    let worker_bit = 1u64 << id;

    while !dispatcher.is_stopped() {
        drain_change_mask(id, worker_bit, dispatcher.as_ref(), &mut active, &mut sum_priorities, global_pass);

        if active.is_empty() {
            idle_wait(dispatcher.as_ref());
            continue;
        }

        let Some(&chosen_idx) = active
            .iter()
            .min_by(|a, b| a.1.pass_value.partial_cmp(&b.1.pass_value).unwrap())
            .map(|(idx, _)| idx)
        else {
            continue;
        };

        let Some(state) = dispatcher.slots()[chosen_idx].lock().clone() else {
            active.remove(&chosen_idx);
            continue;
        };

        let morsel_size = {
            let local = active.get(&chosen_idx).unwrap();
            ((local.throughput * T_MAX_SECS) as u64).max(state.job.min_morsel_size()).max(1)
        };

        let start = Instant::now();
        let had_work = state.job.execute_next_morsel(morsel_size, &worker);
        let elapsed = start.elapsed().as_secs_f64().max(1e-9);

        if had_work {
            let local = active.get_mut(&chosen_idx).unwrap();
            local.pass_value += elapsed / local.priority.max(1e-9);
            global_pass += elapsed / sum_priorities.max(1e-9);
            let target = morsel_size as f64 / elapsed;
            let raw = ALPHA * target + (1.0 - ALPHA) * local.throughput;
            local.throughput = raw.clamp(0.5 * local.throughput, 1.5 * local.throughput);
        } else {
            let local = active.remove(&chosen_idx).unwrap();
            sum_priorities = (sum_priorities - local.priority).max(0.0);
            mark_done_and_maybe_finalize(worker_bit, dispatcher.as_ref(), chosen_idx, &state);
        }
    }
}

fn drain_change_mask(
    id: usize,
    worker_bit: u64,
    dispatcher: &Dispatcher,
    active: &mut HashMap<usize, ActiveSlot>,
    sum_priorities: &mut f64,
    global_pass: f64,
) {
    let masks = &dispatcher.change_masks()[id];
    for word in 0..2 {
        let bits = masks[word].swap(0, Ordering::AcqRel);
        let mut remaining = bits;
        while remaining != 0 {
            let local_bit = remaining.trailing_zeros() as usize;
            let idx = word * 64 + local_bit;
            remaining &= remaining - 1;
            if active.contains_key(&idx) {
                continue;
            }
            let Some(state) = dispatcher.slots()[idx].lock().clone() else { continue };
            let priority = state.job.priority();
            let throughput = 1.0 / state.job.expected_time_per_unit().max(1e-9);
            active.insert(idx, ActiveSlot { pass_value: global_pass, priority, throughput });
            *sum_priorities += priority;
            state.engaged_mask.fetch_or(worker_bit, Ordering::AcqRel);
        }
    }
}

fn mark_done_and_maybe_finalize(worker_bit: u64, dispatcher: &super::Dispatcher, idx: usize, state: &super::SlotState) {
    let done = state.done_mask.fetch_or(worker_bit, Ordering::AcqRel) | worker_bit;
    let engaged = state.engaged_mask.load(Ordering::Acquire);
    if done & engaged == engaged && state.finalizing.compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
        state.job.finalize();
        // Free the slot for reuse by a later `submit` now that every worker
        // that ever touched it has observed it exhausted.
        *dispatcher.slots()[idx].lock() = None;
    }
}

fn idle_wait(dispatcher: &Dispatcher) {
    let idle = dispatcher.idle();
    let guard = idle.mutex.lock().unwrap();
    let _ = idle.cvar.wait_timeout(guard, Duration::from_millis(1)).unwrap();
}
