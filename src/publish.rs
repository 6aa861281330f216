// Single-producer/single-consumer publishing slot: "latest wins" handoff
// between the interpreter thread (producer) and the host thread (consumer).
// Deliberately not a queue -- intermediate frames may be dropped, and the
// producer never blocks on the consumer.

use std::sync::{Arc, Mutex};

struct Shared<T> {
    public: Mutex<Option<Box<T>>>,
    free_list: Mutex<Vec<Box<T>>>,
}

pub struct Producer<T> {
    private: Option<Box<T>>,
    shared: Arc<Shared<T>>,
}

pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

pub fn channel<T: Default>() -> (Producer<T>, Consumer<T>) {
    let shared = Arc::new(Shared {
        public: Mutex::new(None),
        free_list: Mutex::new(Vec::new()),
    });
    let producer = Producer {
        private: Some(Box::new(T::default())),
        shared: shared.clone(),
    };
    let consumer = Consumer { shared };
    (producer, consumer)
}

impl<T: Default> Producer<T> {
    pub fn current(&mut self) -> &mut T {
        self.private.as_mut().expect("producer always holds a private buffer")
    }

    /// Atomic-exchange the private slot with the public slot; if the prior
    /// public slot was empty (nobody has taken it, or this is the first
    /// publish), recycle from the free list or allocate fresh.
    pub fn publish(&mut self) {
        let finished = self.private.take().expect("producer always holds a private buffer");
        let old_public = {
            let mut public = self.shared.public.lock().unwrap();
            public.replace(finished)
        };
        self.private = Some(match old_public {
            Some(buf) => buf,
            None => {
                let mut free_list = self.shared.free_list.lock().unwrap();
                free_list.pop().unwrap_or_else(|| Box::new(T::default()))
            }
        });
    }
}

impl<T> Consumer<T> {
    /// Atomic-exchange the public slot with `None`. The caller owns the
    /// returned buffer until it calls `return_buffer`.
    pub fn take(&self) -> Option<Box<T>> {
        self.shared.public.lock().unwrap().take()
    }

    pub fn return_buffer(&self, buf: Box<T>) {
        self.shared.free_list.lock().unwrap().push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Frame {
        number: u64,
    }

    #[test]
    fn consumer_never_sees_a_stale_frame_number() {
        let (mut producer, consumer) = channel::<Frame>();
        let mut last_seen = 0u64;
        for n in 1..=5u64 {
            producer.current().number = n;
            producer.publish();
            if let Some(frame) = consumer.take() {
                assert!(frame.number > last_seen);
                last_seen = frame.number;
                consumer.return_buffer(frame);
            }
        }
        assert_eq!(last_seen, 5);
    }

    #[test]
    fn publish_without_consumer_reuses_the_same_buffer() {
        let (mut producer, consumer) = channel::<Frame>();
        producer.current().number = 1;
        producer.publish();
        producer.current().number = 2;
        producer.publish();
        let frame = consumer.take().unwrap();
        assert_eq!(frame.number, 2);
    }
}
