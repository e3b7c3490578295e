// Canvas memory management
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! A canvas is an 8-bit, row-major pixel buffer scattered over page frames.
//! The accelerator finds those frames through a one-page table with one
//! entry per canvas page, in canvas order.

use std::sync::Arc;

use log::debug;

use crate::{
    dma::{DmaFrame, DmaMemory},
    history::Dimensions,
    hw::{pte, PAGE_SIZE},
    Error, Result,
};

pub const MIN_CANVAS_SIZE: u16 = 1;
pub const MAX_CANVAS_SIZE: u16 = 2048;

impl Dimensions {
    pub fn is_valid(&self) -> bool {
        (MIN_CANVAS_SIZE..=MAX_CANVAS_SIZE).contains(&self.width)
            && (MIN_CANVAS_SIZE..=MAX_CANVAS_SIZE).contains(&self.height)
    }

    /// Canvas size in bytes.
    pub fn bytes(&self) -> usize {
        usize::from(self.width) * usize::from(self.height)
    }

    pub fn page_count(&self) -> usize {
        self.bytes().div_ceil(PAGE_SIZE)
    }
}

/// Frames backing one initialized canvas.
pub struct Canvas {
    dims: Dimensions,
    dma: DmaMemory,
    // Shared with mappings handed out to the client.
    pages: Arc<Vec<DmaFrame>>,
    page_table: DmaFrame,
}

impl Canvas {
    /// Allocates zeroed canvas pages and fills in the page table.
    ///
    /// Either every frame is obtained or none is kept: frames allocated
    /// before a failure go back to the pool when the partial vector drops.
    pub fn allocate(dma: &DmaMemory, dims: Dimensions) -> Result<Self> {
        if !dims.is_valid() {
            return Err(Error::InvalidDimensions(dims.width, dims.height));
        }

        let count = dims.page_count();
        let pages = (0..count)
            .map(|_| dma.alloc_frame())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let page_table = dma.alloc_frame()?;

        for (i, page) in pages.iter().enumerate() {
            dma.write_u32(page_table.bus_addr() + 4 * i as u32, pte(page.bus_addr()))?;
        }

        debug!(
            "canvas {}x{}: {count} pages, page table at {:#x}",
            dims.width,
            dims.height,
            page_table.bus_addr()
        );

        Ok(Self {
            dims,
            dma: dma.clone(),
            pages: Arc::new(pages),
            page_table,
        })
    }

    pub fn dims(&self) -> Dimensions {
        self.dims
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_table_addr(&self) -> u32 {
        self.page_table.bus_addr()
    }

    pub fn page_addrs(&self) -> impl Iterator<Item = u32> + '_ {
        self.pages.iter().map(DmaFrame::bus_addr)
    }

    /// Copies the whole canvas out, row-major, `width * height` bytes.
    pub fn read_pixels(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.dims.bytes()];
        for (chunk, page) in buf.chunks_mut(PAGE_SIZE).zip(self.pages.iter()) {
            self.dma.read(page.bus_addr(), chunk)?;
        }
        Ok(buf)
    }

    pub fn mapping(&self) -> CanvasMapping {
        CanvasMapping {
            dims: self.dims,
            dma: self.dma.clone(),
            pages: self.pages.clone(),
        }
    }
}

impl std::fmt::Debug for Canvas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canvas")
            .field("dims", &self.dims)
            .field("pages", &self.pages.len())
            .field("page_table", &self.page_table)
            .finish()
    }
}

/// A client view of canvas memory. Pages are resolved one at a time, on
/// fault, and stay alive for as long as the mapping does.
#[derive(Clone)]
pub struct CanvasMapping {
    dims: Dimensions,
    dma: DmaMemory,
    pages: Arc<Vec<DmaFrame>>,
}

impl std::fmt::Debug for CanvasMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanvasMapping")
            .field("dims", &self.dims)
            .field("pages", &self.pages.len())
            .finish_non_exhaustive()
    }
}

impl CanvasMapping {
    pub fn dims(&self) -> Dimensions {
        self.dims
    }

    /// Mapping length in bytes, a whole number of pages.
    pub fn len(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Resolves page `pgoff` of the mapping to its bus address.
    pub fn fault(&self, pgoff: usize) -> Result<u32> {
        self.pages
            .get(pgoff)
            .map(DmaFrame::bus_addr)
            .ok_or(Error::PageOutOfRange(pgoff))
    }

    /// Reads one pixel through the mapping.
    pub fn pixel(&self, x: u16, y: u16) -> Result<u8> {
        let offset = usize::from(y) * usize::from(self.dims.width) + usize::from(x);
        let addr = self.fault(offset / PAGE_SIZE)?;
        let mut px = [0u8; 1];
        self.dma.read(addr + (offset % PAGE_SIZE) as u32, &mut px)?;
        Ok(px[0])
    }
}
