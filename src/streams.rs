// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Adapters between channels and host byte streams.
//!
//! These are thin: a producer pump that reads chunks into a channel, a
//! consumer pump that drains a channel into a writer, and [`io::Write`]/
//! [`io::Read`] views over a channel. Behavior with multiple competing
//! adapters on one channel is undefined — use [`tap`] for fan-out.
//!
//! [`tap`]: crate::Channel::tap

use crate::channels::Channel;
use crate::error::Fault;
use crate::executor::later;
use std::io::{self, Read, Write};

/// Pumps `reader` into `chan` in chunks of at most `chunk_size` bytes,
/// one put per chunk, chaining the next read on each ack. EOF puts the
/// end sentinel; a read error is forwarded into the channel as a fault.
pub fn feed_from_reader<R: Read + 'static>(reader: R, chan: Channel<Vec<u8>>, chunk_size: usize) {
    assert!(chunk_size > 0, "chunk size must be positive");

    fn pump<R: Read + 'static>(mut reader: R, chan: Channel<Vec<u8>>, chunk_size: usize) {
        let mut buf = vec![0u8; chunk_size];
        match reader.read(&mut buf) {
            Ok(0) => chan.finish(),
            Ok(n) => {
                buf.truncate(n);
                let next_chan = chan.clone();
                chan.put_with_ack(buf, move |_| pump(reader, next_chan, chunk_size));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => pump(reader, chan, chunk_size),
            Err(e) => chan.send(Err(Fault::new(format!("read failed: {}", e))), None),
        }
    }

    later(move || pump(reader, chan, chunk_size));
}

/// Drains `chan` into `writer`, one take per chunk. The end sentinel
/// flushes and completes `done` with `Ok`; a fault (from the channel or
/// the writer) completes it with `Err`.
pub fn drain_to_writer<W: Write + 'static>(
    chan: Channel<Vec<u8>>,
    writer: W,
    done: impl FnOnce(Result<(), Fault>) + 'static,
) {
    fn pump<W: Write + 'static>(
        chan: Channel<Vec<u8>>,
        mut writer: W,
        done: Box<dyn FnOnce(Result<(), Fault>)>,
    ) {
        let next_chan = chan.clone();
        chan.take(move |item| match item {
            Ok(Some(bytes)) => match writer.write_all(&bytes) {
                Ok(()) => pump(next_chan, writer, done),
                Err(e) => done(Err(Fault::new(format!("write failed: {}", e)))),
            },
            Ok(None) => {
                done(
                    writer
                        .flush()
                        .map_err(|e| Fault::new(format!("flush failed: {}", e))),
                );
            }
            Err(fault) => done(Err(fault)),
        });
    }

    pump(chan, writer, Box::new(done));
}

/// An [`io::Write`] view over a channel: every write is a put.
///
/// Writes never block the caller; with no taker parked, chunks accumulate
/// in the channel.
#[derive(Debug, Clone)]
pub struct ChannelWriter {
    chan: Channel<Vec<u8>>,
}

impl ChannelWriter {
    /// Creates a writer view over `chan`.
    pub fn new(chan: Channel<Vec<u8>>) -> ChannelWriter {
        ChannelWriter { chan }
    }

    /// Puts the end sentinel, signaling readers that the stream is over.
    pub fn finish(&self) {
        self.chan.finish();
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.chan.put(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An [`io::Read`] view over a channel.
///
/// Reads are non-blocking: with nothing parked in the channel, `read`
/// returns [`io::ErrorKind::WouldBlock`]. The end sentinel reads as EOF.
#[derive(Debug)]
pub struct ChannelReader {
    chan: Channel<Vec<u8>>,
    pending: Vec<u8>,
}

impl ChannelReader {
    /// Creates a reader view over `chan`.
    pub fn new(chan: Channel<Vec<u8>>) -> ChannelReader {
        ChannelReader {
            chan,
            pending: Vec::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.chan.try_take() {
                Some(Ok(Some(bytes))) => self.pending = bytes,
                Some(Ok(None)) => return Ok(0),
                Some(Err(fault)) => return Err(fault.into()),
                None => return Err(io::ErrorKind::WouldBlock.into()),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::enclose;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn reader_to_writer_round_trip() {
        let out: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let finished = Rc::new(Cell::new(false));

        struct SharedSink(Rc<RefCell<Vec<u8>>>);

        impl Write for SharedSink {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.borrow_mut().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        test_executor!(enclose! { (out, finished) {
            let chan = Channel::new();
            feed_from_reader(io::Cursor::new(b"hello channel".to_vec()), chan.clone(), 4);
            drain_to_writer(chan, SharedSink(out), move |result| {
                assert!(result.is_ok());
                finished.set(true);
            });
        }});

        assert!(finished.get());
        assert_eq!(out.borrow().as_slice(), b"hello channel");
    }

    #[test]
    fn drain_forwards_channel_faults() {
        let failed = Rc::new(Cell::new(false));
        test_executor!(enclose! { (failed) {
            let chan: Channel<Vec<u8>> = Channel::new();
            drain_to_writer(chan.clone(), Vec::new(), move |result| {
                failed.set(result.is_err());
            });
            (chan.receive())(Err(Fault::new("upstream died")));
        }});
        assert!(failed.get());
    }

    #[test]
    fn writer_view_feeds_takers() {
        let got = Rc::new(RefCell::new(Vec::new()));
        test_executor!(enclose! { (got) {
            let chan = Channel::new();
            let mut writer = ChannelWriter::new(chan.clone());
            writer.write_all(b"abc").unwrap();
            writer.finish();
            chan.take_n(8, enclose! { (got) move |batch| {
                *got.borrow_mut() = batch.unwrap();
            }});
        }});
        assert_eq!(*got.borrow(), vec![b"abc".to_vec()]);
    }

    #[test]
    fn reader_view_signals_would_block_and_eof() {
        test_executor!({
            let chan: Channel<Vec<u8>> = Channel::new();
            let mut reader = ChannelReader::new(chan.clone());
            let mut buf = [0u8; 8];

            let err = reader.read(&mut buf).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

            chan.put(b"xy".to_vec());
            assert_eq!(reader.read(&mut buf).unwrap(), 2);
            assert_eq!(&buf[..2], b"xy");

            chan.finish();
            assert_eq!(reader.read(&mut buf).unwrap(), 0);
        });
    }
}
