// SPDX-License-Identifier: Apache-2.0

//! The shared, page-aligned memory region backing one worker session.

use std::io;

use bdus_config::limits::page_size;
use bdus_config::{DeviceConfig, SessionConfig};
use memmap2::MmapMut;

use crate::record::ReplyOrItem;

const RECORD_SIZE: usize = size_of::<ReplyOrItem>();

fn page_align(value: usize) -> usize {
    let page = page_size() as usize;
    value.div_ceil(page) * page
}

/// The region a worker maps: a page-padded array of records, one per
/// inverter slot, followed by the session's preallocated payload buffers.
///
/// Each payload buffer is page-aligned and large enough for the biggest
/// payload the device can produce.
pub struct SharedRegion {
    map: MmapMut,
    num_records: u32,
    num_buffers: u32,
    buffer_size: usize,
    buffers_offset: usize,
}

impl SharedRegion {
    /// Allocates a region sized for `device` (adjusted) and `session`
    /// (clamped against it).
    pub fn new(device: &DeviceConfig, session: &SessionConfig) -> io::Result<Self> {
        let num_records = device.max_outstanding_reqs;
        let num_buffers = session.num_preallocated_buffers;
        let buffer_size = page_align(device.max_request_payload_size());
        let buffers_offset = page_align(num_records as usize * RECORD_SIZE);

        let len = buffers_offset + num_buffers as usize * buffer_size;
        let map = MmapMut::map_anon(len.max(page_size() as usize))?;

        tracing::debug!(
            num_records,
            num_buffers,
            buffer_size,
            "shared region allocated"
        );

        Ok(Self {
            map,
            num_records,
            num_buffers,
            buffer_size,
            buffers_offset,
        })
    }

    /// Number of records in the region.
    pub fn num_records(&self) -> u32 {
        self.num_records
    }

    /// Number of preallocated payload buffers.
    pub fn num_preallocated_buffers(&self) -> u32 {
        self.num_buffers
    }

    /// Size of each preallocated payload buffer, in bytes.
    pub fn preallocated_buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// The record at `index`, or `None` if out of range.
    pub fn record(&self, index: u32) -> Option<&ReplyOrItem> {
        self.records().get(index as usize)
    }

    /// The record at `index`, mutably, or `None` if out of range.
    pub fn record_mut(&mut self, index: u32) -> Option<&mut ReplyOrItem> {
        self.records_mut().get_mut(index as usize)
    }

    /// The preallocated buffer at `index`, or `None` if out of range.
    pub fn preallocated_buffer(&self, index: u64) -> Option<&[u8]> {
        let start = self.buffer_start(index)?;
        Some(&self.map[start..start + self.buffer_size])
    }

    /// The preallocated buffer at `index`, mutably, or `None` if out of
    /// range.
    pub fn preallocated_buffer_mut(&mut self, index: u64) -> Option<&mut [u8]> {
        let start = self.buffer_start(index)?;
        Some(&mut self.map[start..start + self.buffer_size])
    }

    fn buffer_start(&self, index: u64) -> Option<usize> {
        if index >= u64::from(self.num_buffers) {
            return None;
        }

        Some(self.buffers_offset + index as usize * self.buffer_size)
    }

    fn records(&self) -> &[ReplyOrItem] {
        // The mapping is page-aligned, which is stricter than the record's
        // 8-byte alignment.
        bytemuck::cast_slice(&self.map[..self.num_records as usize * RECORD_SIZE])
    }

    fn records_mut(&mut self) -> &mut [ReplyOrItem] {
        bytemuck::cast_slice_mut(&mut self.map[..self.num_records as usize * RECORD_SIZE])
    }
}
