// In-memory transports for exercising the handshake without a real
// socket. Used by this crate's own unit and integration tests; exposed
// publicly so embedding applications can write the same kind of test
// without reaching for a loopback TCP connection.

pub mod pipe {
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::sync::{Arc, Condvar, Mutex};

    use crate::connection::{Transport, TransportCloser};

    #[derive(Default)]
    struct Buffer {
        data: VecDeque<u8>,
        closed: bool,
    }

    // One direction of an in-memory duplex connection: what is written
    // to outbound becomes readable from the peer's inbound.
    pub struct PipeHalf {
        outbound: Arc<(Mutex<Buffer>, Condvar)>,
        inbound: Arc<(Mutex<Buffer>, Condvar)>,
    }

    // Builds a pair of connected, bidirectional, blocking in-memory
    // transports: the test-only stand-in for a socket pair.
    pub fn bipipe() -> (PipeHalf, PipeHalf) {
        let a_to_b = Arc::new((Mutex::new(Buffer::default()), Condvar::new()));
        let b_to_a = Arc::new((Mutex::new(Buffer::default()), Condvar::new()));

        let a = PipeHalf {
            outbound: a_to_b.clone(),
            inbound: b_to_a.clone(),
        };
        let b = PipeHalf {
            outbound: b_to_a,
            inbound: a_to_b,
        };
        (a, b)
    }

    impl PipeHalf {
        // Closes this half's outbound direction: further reads on the
        // peer observe EOF once buffered bytes are drained.
        pub fn close(&mut self) -> io::Result<()> {
            let (lock, cvar) = &*self.outbound;
            let mut buf = lock.lock().unwrap();
            buf.closed = true;
            cvar.notify_all();
            Ok(())
        }

        // Non-blocking peek at how many bytes this half could currently
        // read without waiting. Used by tests asserting that a role
        // writes nothing before some precondition is met.
        pub fn pending_inbound_len(&self) -> usize {
            let (lock, _) = &*self.inbound;
            lock.lock().unwrap().data.len()
        }
    }

    impl Read for PipeHalf {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let (lock, cvar) = &*self.inbound;
            let mut buf = lock.lock().unwrap();
            while buf.data.is_empty() && !buf.closed {
                buf = cvar.wait(buf).unwrap();
            }
            let n = buf.data.len().min(out.len());
            for slot in out.iter_mut().take(n) {
                *slot = buf.data.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for PipeHalf {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            let (lock, cvar) = &*self.outbound;
            let mut buf = lock.lock().unwrap();
            if buf.closed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe half closed"));
            }
            buf.data.extend(data.iter().copied());
            cvar.notify_all();
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for PipeHalf {
        fn close(&mut self) -> io::Result<()> {
            PipeHalf::close(self)
        }

        fn closer(&self) -> io::Result<Box<dyn TransportCloser>> {
            Ok(Box::new(PipeCloser(self.outbound.clone())))
        }
    }

    struct PipeCloser(Arc<(Mutex<Buffer>, Condvar)>);

    impl TransportCloser for PipeCloser {
        fn close(self: Box<Self>) -> io::Result<()> {
            let (lock, cvar) = &*self.0;
            let mut buf = lock.lock().unwrap();
            buf.closed = true;
            cvar.notify_all();
            Ok(())
        }
    }

    // Wraps a PipeHalf and counts close() calls, for tests that assert
    // the handshake wrapper tears down the transport on failure.
    pub struct CloseCountingPipe {
        pub inner: PipeHalf,
        pub closes: Arc<Mutex<usize>>,
    }

    impl CloseCountingPipe {
        pub fn wrap(inner: PipeHalf) -> Self {
            CloseCountingPipe {
                inner,
                closes: Arc::new(Mutex::new(0)),
            }
        }

        pub fn close_count(&self) -> usize {
            *self.closes.lock().unwrap()
        }

        pub fn close(&mut self) -> io::Result<()> {
            *self.closes.lock().unwrap() += 1;
            self.inner.close()
        }
    }

    impl Read for CloseCountingPipe {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            self.inner.read(out)
        }
    }

    impl Write for CloseCountingPipe {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.inner.write(data)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl Transport for CloseCountingPipe {
        fn close(&mut self) -> io::Result<()> {
            CloseCountingPipe::close(self)
        }

        fn closer(&self) -> io::Result<Box<dyn TransportCloser>> {
            Ok(Box::new(CountingCloser {
                inner: self.inner.closer()?,
                closes: self.closes.clone(),
            }))
        }
    }

    struct CountingCloser {
        inner: Box<dyn TransportCloser>,
        closes: Arc<Mutex<usize>>,
    }

    impl TransportCloser for CountingCloser {
        fn close(self: Box<Self>) -> io::Result<()> {
            *self.closes.lock().unwrap() += 1;
            self.inner.close()
        }
    }
}
