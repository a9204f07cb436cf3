//! Windowed READ/WRITE over a single connection.
//!
//! A call keeps up to `max_outstanding` sub-requests of `request_len`
//! bytes in flight and matches the replies back to their slots by id,
//! in whatever order the server answers.

use crate::{
    buffer::{Buffer, MAX_FRAME_LEN},
    error::{Error, Result},
    sftp::{Channel, Reply, SSH_FXP_READ, SSH_FXP_WRITE, SSH_FX_EOF},
};
use std::{collections::VecDeque, io};

/// The longest sub-request whose DATA reply still fits in one frame
/// (type, id and data length precede the payload).
pub const MAX_REQUEST_LEN: u32 = MAX_FRAME_LEN - 9;

/// Window shape of a pipelined transfer.
#[derive(Debug, Copy, Clone)]
pub struct Window {
    pub request_len: u32,
    pub max_outstanding: usize,
}

impl Window {
    fn request_len(&self) -> usize {
        self.request_len.max(1).min(MAX_REQUEST_LEN) as usize
    }
}

/// Fail unless every byte of `offset..offset + len` has a representable
/// file offset.
pub fn check_range(offset: u64, len: usize) -> Result<()> {
    match offset.checked_add(len as u64) {
        Some(..) => Ok(()),
        None => Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "transfer extends past the largest file offset",
        ))),
    }
}

#[derive(Debug)]
struct Slot {
    id: u32,
    len: usize,
    // position within the caller's buffer
    offset: usize,
}

fn take_slot(window: &mut VecDeque<Slot>, id: u32) -> Result<Slot> {
    window
        .iter()
        .position(|slot| slot.id == id)
        .and_then(|pos| window.remove(pos))
        .ok_or_else(|| Error::protocol(format!("reply for unknown request (id = {})", id)))
}

fn abort(channel: &mut Channel, window: VecDeque<Slot>, err: Error) -> Error {
    if !window.is_empty() {
        tracing::debug!(outstanding = window.len(), "aborting pipelined transfer");
    }
    channel.abandon(window.into_iter().map(|slot| slot.id));
    err
}

async fn send_read(
    channel: &mut Channel,
    handle: &[u8],
    offset: u64,
    len: usize,
) -> Result<u32> {
    let id = channel.next_id();
    channel
        .send(SSH_FXP_READ, id, |buf: &mut Buffer| {
            buf.put_block(handle);
            buf.put_u64(offset);
            buf.put_u32(len as u32);
        })
        .await?;
    Ok(id)
}

/// Read into `buf` starting at the remote file position `offset`.
///
/// Returns the number of bytes read, which is less than `buf.len()` when
/// the end of file was hit past the first byte. Hitting the end of file
/// right at `offset` fails with [`Error::Eof`].
pub async fn read(
    channel: &mut Channel,
    handle: &[u8],
    offset: u64,
    buf: &mut [u8],
    win: Window,
) -> Result<usize> {
    check_range(offset, buf.len())?;
    let request_len = win.request_len();
    let max_outstanding = win.max_outstanding.max(1);

    let mut total = buf.len();
    let mut requested = 0;
    let mut bytes_read = 0;
    let mut window = VecDeque::with_capacity(max_outstanding);

    loop {
        while window.len() < max_outstanding && requested < total {
            let len = std::cmp::min(request_len, total - requested);
            let id = send_read(channel, handle, offset + requested as u64, len).await?;
            window.push_back(Slot {
                id,
                len,
                offset: requested,
            });
            requested += len;
        }

        if window.is_empty() {
            break;
        }

        let (id, reply) = channel.recv().await?;
        let slot = match take_slot(&mut window, id) {
            Ok(slot) => slot,
            Err(err) => return Err(abort(channel, window, err)),
        };

        match reply {
            Reply::Data(data) => {
                if data.len() > slot.len {
                    let err = Error::protocol(format!(
                        "received more data than requested ({} > {})",
                        data.len(),
                        slot.len
                    ));
                    return Err(abort(channel, window, err));
                }
                buf[slot.offset..slot.offset + data.len()].copy_from_slice(&data);
                bytes_read += data.len();

                if data.len() < slot.len {
                    let rest_offset = slot.offset + data.len();
                    let rest_len = slot.len - data.len();
                    if rest_offset < total {
                        tracing::trace!(id, got = data.len(), rest_len, "short read");
                        let id = send_read(channel, handle, offset + rest_offset as u64, rest_len)
                            .await?;
                        window.push_back(Slot {
                            id,
                            len: rest_len,
                            offset: rest_offset,
                        });
                    }
                }
            }

            Reply::Status(st) if st.code == SSH_FX_EOF => {
                if slot.offset == 0 {
                    return Err(abort(channel, window, Error::Eof));
                }
                total = std::cmp::min(total, slot.offset);
            }

            Reply::Status(st) => {
                let err = match st.into_result() {
                    Ok(()) => Error::protocol("got SSH_FX_OK in reply to READ"),
                    Err(err) => err,
                };
                return Err(abort(channel, window, err));
            }

            reply => {
                let err = Error::protocol(format!("unexpected reply to READ: {:?}", reply));
                return Err(abort(channel, window, err));
            }
        }
    }

    Ok(std::cmp::min(bytes_read, total))
}

/// Write `data` at the remote file position `offset`.
///
/// The first failed sub-request aborts the whole write.
pub async fn write(
    channel: &mut Channel,
    handle: &[u8],
    offset: u64,
    data: &[u8],
    win: Window,
) -> Result<usize> {
    check_range(offset, data.len())?;
    let request_len = win.request_len();
    let max_outstanding = win.max_outstanding.max(1);

    let mut requested = 0;
    let mut window = VecDeque::with_capacity(max_outstanding);

    loop {
        while window.len() < max_outstanding && requested < data.len() {
            let len = std::cmp::min(request_len, data.len() - requested);
            let chunk = &data[requested..requested + len];
            let id = channel.next_id();
            channel
                .send(SSH_FXP_WRITE, id, |buf| {
                    buf.put_block(handle);
                    buf.put_u64(offset + requested as u64);
                    buf.put_block(chunk);
                })
                .await?;
            window.push_back(Slot {
                id,
                len,
                offset: requested,
            });
            requested += len;
        }

        if window.is_empty() {
            break;
        }

        let (id, reply) = channel.recv().await?;
        if let Err(err) = take_slot(&mut window, id) {
            return Err(abort(channel, window, err));
        }

        match reply {
            Reply::Status(st) => {
                if let Err(err) = st.into_result() {
                    return Err(abort(channel, window, err));
                }
            }
            reply => {
                let err = Error::protocol(format!("unexpected reply to WRITE: {:?}", reply));
                return Err(abort(channel, window, err));
            }
        }
    }

    Ok(data.len())
}
