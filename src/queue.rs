//! A dual-headed, bounded multi-producer/multi-consumer FIFO queue.
//!
//! Producers and consumers almost never contend on the same lock: the
//! producer-side list and the consumer-side list are guarded by separate
//! mutexes, and the two are only ever brought together in [`swap`], which
//! reparents the whole producer list onto the consumer side in one critical
//! section. Nested acquisition order is always **get before put**.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// Producer-side state: the pending list, the soft bound on its size, and the
/// nonblock flag, all guarded together because `put` and `set_nonblock` need
/// to observe them atomically with respect to each other.
struct PutSide<T> {
    list: VecDeque<T>,
    msg_cnt: usize,
    nonblock: bool,
}

/// A bounded (or unbounded) FIFO queue with independent producer and consumer
/// critical sections.
///
/// `msg_max == 0` means unbounded: `put` never waits for room. For
/// `msg_max > 0`, `put` blocks (unless the queue is in nonblock mode) while
/// the outstanding message count is at or above `msg_max`.
pub struct MsgQueue<T> {
    msg_max: usize,
    get_side: Mutex<VecDeque<T>>,
    get_cond: Condvar,
    put_side: Mutex<PutSide<T>>,
    put_cond: Condvar,
}

impl<T> std::fmt::Debug for MsgQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgQueue")
            .field("msg_max", &self.msg_max)
            .finish_non_exhaustive()
    }
}

impl<T> MsgQueue<T> {
    /// Creates an empty queue in blocking mode. `maxlen == 0` means
    /// unbounded.
    ///
    /// # Examples
    /// ```
    /// # use taskpool::queue::MsgQueue;
    /// let queue: MsgQueue<u32> = MsgQueue::new(0);
    /// queue.put(7);
    /// assert_eq!(queue.get(), Some(7));
    /// ```
    pub fn new(maxlen: usize) -> Self {
        Self {
            msg_max: maxlen,
            get_side: Mutex::new(VecDeque::new()),
            get_cond: Condvar::new(),
            put_side: Mutex::new(PutSide {
                list: VecDeque::new(),
                msg_cnt: 0,
                nonblock: false,
            }),
            put_cond: Condvar::new(),
        }
    }

    /// Appends `msg` to the tail of the producer list, blocking while the
    /// queue is full and in blocking mode.
    pub fn put(&self, msg: T) {
        let mut put = self.put_side.lock();

        if self.msg_max > 0 {
            while put.msg_cnt >= self.msg_max && !put.nonblock {
                self.put_cond.wait(&mut put);
            }
        }

        put.list.push_back(msg);
        put.msg_cnt += 1;
        drop(put);

        self.get_cond.notify_one();
    }

    /// Pops the head of the consumer list, swapping the producer list in if
    /// the consumer list is empty. Returns `None` only when the queue is in
    /// nonblock mode and nothing is available.
    pub fn get(&self) -> Option<T> {
        let mut get = self.get_side.lock();

        if let Some(msg) = get.pop_front() {
            return Some(msg);
        }

        let swapped = self.swap(&mut get);
        if swapped == 0 {
            return None;
        }
        get.pop_front()
    }

    /// Reparents the producer list onto the (now-empty) consumer list. Called
    /// only while `get_mutex` is held. Returns the number of messages moved
    /// over.
    fn swap(&self, get: &mut VecDeque<T>) -> usize {
        let mut put = self.put_side.lock();

        while put.msg_cnt == 0 && !put.nonblock {
            // Waiting on `get_cond` while holding `put_mutex` is unusual but
            // correct: `put` signals `get_cond` while holding `put_mutex`,
            // and this is the only place the two mutexes nest.
            self.get_cond.wait(&mut put);
        }

        let cnt = put.msg_cnt;

        if self.msg_max > 0 && cnt >= self.msg_max {
            self.put_cond.notify_all();
        }

        std::mem::swap(get, &mut put.list);
        put.msg_cnt = 0;

        cnt
    }

    /// Switches the queue to nonblock mode: both `get` and `put` return
    /// immediately instead of waiting, and any thread already waiting is
    /// woken up to re-evaluate its predicate.
    ///
    /// Only takes `put_mutex`: `nonblock` lives in [`PutSide`], and a
    /// consumer parked in [`swap`](Self::swap) holds `get_mutex` for the
    /// whole time it waits on `get_cond`, so requiring `get_mutex` here too
    /// would deadlock against every idle worker.
    pub fn set_nonblock(&self) {
        let mut put = self.put_side.lock();
        put.nonblock = true;
        drop(put);

        self.get_cond.notify_all();
        self.put_cond.notify_all();
    }

    /// Restores blocking semantics.
    pub fn set_block(&self) {
        self.put_side.lock().nonblock = false;
    }

    /// Removes and returns every message currently held by the queue, on
    /// either side, leaving it empty. Used to recover tasks still queued at
    /// shutdown.
    pub fn drain(&self) -> Vec<T> {
        let mut get = self.get_side.lock();
        let mut put = self.put_side.lock();

        let mut drained: Vec<T> = get.drain(..).collect();
        drained.extend(put.list.drain(..));
        put.msg_cnt = 0;

        drained
    }

    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.get_side.lock().len() + self.put_side.lock().list.len()
    }
}
