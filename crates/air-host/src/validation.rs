// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end validation programs
//!
//! The two board bring-up programs, expressed against [`AirDevice`]:
//!
//! | Scenario | What moves |
//! |----------|------------|
//! | [`shim_dma_all_channels`] | 32-word blocks through both channels of shim columns 18 and 11, there and back |
//! | [`matrix_add`] | a 128x16 image cut into 16x8 tiles by a 4-D transfer, added tile by tile, reassembled |
//!
//! Tile buffer accessors and tile configuration only exist on the software
//! fabric; on hardware the tiles are configured out of band and only the
//! staging buffer is checked.

use crate::backends::{DmaPort, TileArray, TileBuffers, TileKernel};
use crate::device::AirDevice;
use crate::error::{AirError, Result};
use crate::wait::WaitPolicy;
use air_packet::{Command, DeviceInit, Dim, Direction, HerdInit, NdMemcpy};
use std::fmt;
use tracing::{info, warn};

/// One unexpected word
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// Buffer or staging area checked
    pub location: String,
    /// Word index
    pub index: usize,
    /// Value the scenario expects
    pub expected: u32,
    /// Value found
    pub actual: u32,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]: expected {:08X}, got {:08X}",
            self.location, self.index, self.expected, self.actual
        )
    }
}

/// Outcome of a scenario
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    /// Scenario name
    pub name: &'static str,
    /// Words compared
    pub checked: usize,
    /// Words that differed
    pub mismatches: Vec<Mismatch>,
}

impl ValidationReport {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            checked: 0,
            mismatches: Vec::new(),
        }
    }

    /// True when every word matched
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }

    fn check(&mut self, location: &str, index: usize, expected: u32, actual: u32) {
        self.checked += 1;
        if expected != actual {
            self.mismatches.push(Mismatch {
                location: location.to_string(),
                index,
                expected,
                actual,
            });
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passed() {
            write!(f, "{}: PASS ({} words)", self.name, self.checked)
        } else {
            write!(
                f,
                "{}: fail {}/{}",
                self.name,
                self.mismatches.len(),
                self.checked
            )
        }
    }
}

/// Available scenarios
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// All channels of two shim DMAs
    ShimDma,
    /// Tiled image addition
    MatrixAdd,
}

impl Scenario {
    /// Every scenario, in the order they are usually run
    pub const ALL: [Self; 2] = [Self::ShimDma, Self::MatrixAdd];

    /// Run on `device`
    ///
    /// # Errors
    ///
    /// See the individual scenario functions.
    pub fn run(self, device: &AirDevice, policy: &WaitPolicy) -> Result<ValidationReport> {
        match self {
            Self::ShimDma => shim_dma_all_channels(device, policy),
            Self::MatrixAdd => matrix_add(device, policy),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShimDma => write!(f, "shim-dma"),
            Self::MatrixAdd => write!(f, "matrix-add"),
        }
    }
}

/// Run `f` on the fabric's tiles, if there is a fabric
///
/// The lock is released before returning, so never wait inside `f`.
fn with_tiles<T>(device: &AirDevice, f: impl FnOnce(&mut TileArray) -> Result<T>) -> Result<Option<T>> {
    device
        .fabric()
        .map(|fabric| f(&mut fabric.tiles()))
        .transpose()
}

fn ensure_staging(device: &AirDevice, bytes: usize) -> Result<()> {
    let have = device.staging().size();
    if have < bytes {
        return Err(AirError::invalid_config(format!(
            "scenario needs {bytes:#x} staging bytes, have {have:#x}"
        )));
    }
    Ok(())
}

fn init_herd(device: &AirDevice, herd: HerdInit, policy: &WaitPolicy) -> Result<()> {
    let pkt = device.submit(&Command::HerdInit(herd))?;
    device.dispatch_and_wait_with(pkt.index(), pkt, policy)
}

fn read_staging(device: &AirDevice, word: usize, count: usize) -> Result<Vec<u32>> {
    let mut out = vec![0u32; count];
    device.staging().read_words(word * 4, &mut out)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Shim DMA, all channels
// ---------------------------------------------------------------------------

/// Words per block
pub const DMA_COUNT: usize = 32;

const SHIM_BUFFERS: [&str; 4] = ["buf72", "buf74", "buf82", "buf84"];

/// Tile buffers and routes of the shim DMA scenario
///
/// Channel 1 feeds `buf72`/`buf74` and drains `buf82`/`buf84`; channel 0
/// does the opposite, so each block crosses both channels.
///
/// # Errors
///
/// Returns error only on a conflicting tile configuration.
pub fn configure_shim_dma_tiles(tiles: &mut TileArray) -> Result<()> {
    tiles.clear();
    for name in SHIM_BUFFERS {
        tiles.add_buffer(name, DMA_COUNT)?;
    }
    for (column, near, far) in [(18, "buf72", "buf82"), (11, "buf74", "buf84")] {
        tiles.route(DmaPort::new(column, 1, Direction::HostToDevice), &[near])?;
        tiles.route(DmaPort::new(column, 0, Direction::HostToDevice), &[far])?;
        tiles.route(DmaPort::new(column, 1, Direction::DeviceToHost), &[far])?;
        tiles.route(DmaPort::new(column, 0, Direction::DeviceToHost), &[near])?;
    }
    Ok(())
}

/// Move two patterns through every shim DMA channel of columns 18 and 11
///
/// Staging layout, in blocks of [`DMA_COUNT`] words: `i`, `2i`, then four
/// blocks of sentinels that the device-to-host transfers overwrite.
///
/// # Errors
///
/// Returns error if the staging buffer is too small or a wait fails.
pub fn shim_dma_all_channels(device: &AirDevice, policy: &WaitPolicy) -> Result<ValidationReport> {
    const BLOCK: u32 = (DMA_COUNT * 4) as u32;
    ensure_staging(device, 6 * DMA_COUNT * 4)?;

    with_tiles(device, |tiles| {
        configure_shim_dma_tiles(tiles)?;
        for i in 0..DMA_COUNT {
            tiles.write_buffer("buf72", i, 0xdead_beef)?;
            tiles.write_buffer("buf74", i, 0xfeed_f00d)?;
        }
        Ok(())
    })?;

    let mut image = Vec::with_capacity(6 * DMA_COUNT);
    for fill in [None, None, Some(0x1001_ba11), Some(0x1005_1ade), Some(0x2001_ba11), Some(0x2005_1ade)] {
        let block = image.len() / DMA_COUNT;
        image.extend((0..DMA_COUNT as u32).map(|i| fill.unwrap_or(i * (block as u32 + 1))));
    }
    device.staging().write_words(0, &image)?;

    init_herd(
        device,
        HerdInit {
            herd_id: 0,
            start_column: 7,
            num_columns: 2,
            start_row: 0,
            num_rows: 5,
        },
        policy,
    )?;

    let base = device.staging_addr(0);
    let block = |n: u64| base + n * u64::from(BLOCK);
    let copy = |column, direction, channel, address| {
        Command::NdMemcpy(NdMemcpy::contiguous(0, column, channel, direction, address, BLOCK))
    };
    let batch = [
        copy(18, Direction::HostToDevice, 1, block(0)),
        copy(11, Direction::HostToDevice, 1, block(1)),
        copy(18, Direction::DeviceToHost, 1, block(4)),
        copy(11, Direction::DeviceToHost, 1, block(5)),
        copy(18, Direction::HostToDevice, 0, block(0)),
        copy(11, Direction::HostToDevice, 0, block(1)),
        copy(18, Direction::DeviceToHost, 0, block(2)),
        copy(11, Direction::DeviceToHost, 0, block(3)),
    ];
    device.run_batch(&batch, policy)?;

    let mut report = ValidationReport::new("shim-dma-all-channels");
    let pattern = |i: usize, scale: u32| i as u32 * scale;

    with_tiles(device, |tiles| {
        for (name, scale) in SHIM_BUFFERS.into_iter().zip([1, 2, 1, 2]) {
            for i in 0..DMA_COUNT {
                report.check(name, i, pattern(i, scale), tiles.read_buffer(name, i)?);
            }
        }
        Ok(())
    })?;

    for (block, scale) in [(2, 1), (3, 2), (4, 1), (5, 2)] {
        let words = read_staging(device, block * DMA_COUNT, DMA_COUNT)?;
        let location = format!("staging block {block}");
        for (i, d) in words.into_iter().enumerate() {
            report.check(&location, i, pattern(i, scale), d);
        }
    }

    log_report(&report);
    Ok(report)
}

// ---------------------------------------------------------------------------
// Tiled matrix add
// ---------------------------------------------------------------------------

/// Image width in words
pub const IMAGE_WIDTH: usize = 128;
/// Image height in rows
pub const IMAGE_HEIGHT: usize = 16;
/// Words per image
pub const IMAGE_SIZE: usize = IMAGE_WIDTH * IMAGE_HEIGHT;
/// Tile width in words
pub const TILE_WIDTH: usize = 16;
/// Tile height in rows
pub const TILE_HEIGHT: usize = 8;
/// Words per tile
pub const TILE_SIZE: usize = TILE_WIDTH * TILE_HEIGHT;

const MATRIX_COLUMN: u8 = 7;

/// `c = a + b` over ping/pong buffer pairs
///
/// Waits until the current `a` and `b` are full and `c` is empty, then
/// adds, releases the inputs and marks the output full. Alternates between
/// the ping and pong sets.
#[derive(Debug)]
pub struct AddKernel {
    sets: [[String; 3]; 2],
    phase: usize,
}

impl AddKernel {
    /// Kernel over `[a, b, c]` ping and pong buffer names
    pub fn ping_pong(ping: [&str; 3], pong: [&str; 3]) -> Self {
        Self {
            sets: [ping.map(str::to_string), pong.map(str::to_string)],
            phase: 0,
        }
    }
}

impl TileKernel for AddKernel {
    fn name(&self) -> &str {
        "add"
    }

    fn step(&mut self, buffers: &mut TileBuffers) -> bool {
        let [a, b, c] = &self.sets[self.phase];
        if !buffers.is_full(a) || !buffers.is_full(b) || buffers.is_full(c) {
            return false;
        }
        let sum: Vec<u32> = match (buffers.get(a), buffers.get(b)) {
            (Some(a), Some(b)) => a
                .words()
                .iter()
                .zip(b.words())
                .map(|(x, y)| x.wrapping_add(*y))
                .collect(),
            _ => return false,
        };
        let Some(out) = buffers.get_mut(c) else {
            return false;
        };
        for (o, s) in out.words_mut().iter_mut().zip(sum) {
            *o = s;
        }
        let flipped = buffers.set_full(a, false).is_ok()
            && buffers.set_full(b, false).is_ok()
            && buffers.set_full(c, true).is_ok();
        self.phase ^= 1;
        flipped
    }
}

/// Tile buffers, routes and kernel of the matrix add scenario
///
/// # Errors
///
/// Returns error only on a conflicting tile configuration.
pub fn configure_matrix_add_tiles(tiles: &mut TileArray) -> Result<()> {
    tiles.clear();
    for name in ["ping_a", "pong_a", "ping_b", "pong_b", "ping_c", "pong_c"] {
        tiles.add_buffer(name, TILE_SIZE)?;
    }
    tiles.route(
        DmaPort::new(MATRIX_COLUMN, 0, Direction::HostToDevice),
        &["ping_a", "pong_a"],
    )?;
    tiles.route(
        DmaPort::new(MATRIX_COLUMN, 1, Direction::HostToDevice),
        &["ping_b", "pong_b"],
    )?;
    tiles.route(
        DmaPort::new(MATRIX_COLUMN, 0, Direction::DeviceToHost),
        &["ping_c", "pong_c"],
    )?;
    tiles.add_kernel(Box::new(AddKernel::ping_pong(
        ["ping_a", "ping_b", "ping_c"],
        ["pong_a", "pong_b", "pong_c"],
    )));
    Ok(())
}

/// 4-D transfer cutting the image at `address` into tiles, row-tile major
#[allow(clippy::cast_possible_truncation)]
pub fn tiled_image_transfer(channel: u8, direction: Direction, address: u64) -> NdMemcpy {
    NdMemcpy::contiguous(
        0,
        MATRIX_COLUMN,
        channel,
        direction,
        address,
        (TILE_WIDTH * 4) as u32,
    )
    .with_dims(
        Dim::new(TILE_HEIGHT as u16, (IMAGE_WIDTH * 4) as u16),
        Dim::new((IMAGE_WIDTH / TILE_WIDTH) as u16, (TILE_WIDTH * 4) as u16),
        Dim::new(
            (IMAGE_HEIGHT / TILE_HEIGHT) as u16,
            (IMAGE_WIDTH * TILE_HEIGHT * 4) as u16,
        ),
    )
}

/// Add two images tile by tile on the fabric
///
/// Image A holds `i + 1`, image B holds 1, so every output word must be
/// `i + 2`. The read-back packet is queued before the two inputs and is the
/// one waited on.
///
/// # Errors
///
/// Returns error if the staging buffer is too small or a wait fails.
pub fn matrix_add(device: &AirDevice, policy: &WaitPolicy) -> Result<ValidationReport> {
    ensure_staging(device, 3 * IMAGE_SIZE * 4)?;

    with_tiles(device, |tiles| {
        configure_matrix_add_tiles(tiles)?;
        for i in 0..TILE_SIZE {
            let n = i as u32;
            tiles.write_buffer("ping_a", i, 0xabba_0000 + n)?;
            tiles.write_buffer("pong_a", i, 0xdeed_ed00 + n)?;
            tiles.write_buffer("ping_b", i, 0xcafe_0000 + n)?;
            tiles.write_buffer("pong_b", i, 0xfabc_ab00 + n)?;
            tiles.write_buffer("ping_c", i, 0x1234_5670 + n)?;
            tiles.write_buffer("pong_c", i, 0x7654_3210 + n)?;
        }
        Ok(())
    })?;

    let mut image = Vec::with_capacity(3 * IMAGE_SIZE);
    image.extend(1..=IMAGE_SIZE as u32);
    image.extend(std::iter::repeat(1).take(IMAGE_SIZE));
    image.extend(std::iter::repeat(0x00de_face).take(IMAGE_SIZE));
    device.staging().write_words(0, &image)?;

    init_herd(
        device,
        HerdInit {
            herd_id: 0,
            start_column: MATRIX_COLUMN,
            num_columns: 1,
            start_row: 0,
            num_rows: 3,
        },
        policy,
    )?;
    let shim = device.submit(&Command::DeviceInit(DeviceInit {
        num_columns: device.config().num_columns,
    }))?;
    device.dispatch_and_wait_with(shim.index(), shim, policy)?;

    let image_addr = |n: usize| device.staging_addr(n * IMAGE_SIZE * 4);
    let pkt_c = device.submit(&Command::NdMemcpy(tiled_image_transfer(
        0,
        Direction::DeviceToHost,
        image_addr(2),
    )))?;
    device.submit(&Command::NdMemcpy(tiled_image_transfer(
        0,
        Direction::HostToDevice,
        image_addr(0),
    )))?;
    let pkt_b = device.submit(&Command::NdMemcpy(tiled_image_transfer(
        1,
        Direction::HostToDevice,
        image_addr(1),
    )))?;
    device.dispatch_and_wait_with(pkt_b.index(), pkt_c, policy)?;

    let mut report = ValidationReport::new("matrix-add");

    with_tiles(device, |tiles| {
        for i in 0..TILE_SIZE {
            for (a, b, c) in [("ping_a", "ping_b", "ping_c"), ("pong_a", "pong_b", "pong_c")] {
                let sum = tiles.read_buffer(a, i)?.wrapping_add(tiles.read_buffer(b, i)?);
                report.check(c, i, sum, tiles.read_buffer(c, i)?);
            }
        }
        Ok(())
    })?;

    let output = read_staging(device, 2 * IMAGE_SIZE, IMAGE_SIZE)?;
    for (i, d) in output.into_iter().enumerate() {
        report.check("output image", i, i as u32 + 2, d);
    }

    log_report(&report);
    Ok(report)
}

fn log_report(report: &ValidationReport) {
    for m in report.mismatches.iter().take(16) {
        warn!("{}: {m}", report.name);
    }
    info!("{report}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiled_transfer_covers_image_once() {
        let m = tiled_image_transfer(0, Direction::HostToDevice, 0);
        assert_eq!(m.total_bytes(), (IMAGE_SIZE * 4) as u64);
        assert_eq!(m.extent_bytes(), (IMAGE_SIZE * 4) as u64);

        let mut seen = vec![false; IMAGE_SIZE];
        for (addr, len) in m.chunks() {
            for w in 0..len as usize / 4 {
                let idx = addr as usize / 4 + w;
                assert!(!seen[idx], "word {idx} copied twice");
                seen[idx] = true;
            }
        }
        assert!(seen.into_iter().all(|s| s));
    }

    #[test]
    fn test_first_tile_rows() {
        let runs: Vec<_> = tiled_image_transfer(0, Direction::HostToDevice, 0)
            .chunks()
            .take(TILE_HEIGHT + 1)
            .collect();
        // first tile: 8 rows of 16 words, one image row apart
        for (r, (addr, len)) in runs.iter().take(TILE_HEIGHT).enumerate() {
            assert_eq!(*addr, (r * IMAGE_WIDTH * 4) as u64);
            assert_eq!(*len, 64);
        }
        // next tile starts 16 words to the right
        assert_eq!(runs[TILE_HEIGHT].0, 64);
    }

    #[test]
    fn test_add_kernel_alternates() {
        let mut tiles = TileArray::new();
        configure_matrix_add_tiles(&mut tiles).unwrap();
        for name in ["ping_a", "ping_b"] {
            tiles.write_buffer(name, 0, 20).unwrap();
            tiles.buffers_mut().set_full(name, true).unwrap();
        }
        assert!(tiles.run_kernels());
        assert_eq!(tiles.read_buffer("ping_c", 0).unwrap(), 40);
        assert!(!tiles.buffers().is_full("ping_a"));
        assert!(tiles.buffers().is_full("ping_c"));

        // ping inputs again, but the kernel now waits on pong
        for name in ["ping_a", "ping_b"] {
            tiles.buffers_mut().set_full(name, true).unwrap();
        }
        assert!(!tiles.run_kernels());
    }

    #[test]
    fn test_report_display() {
        let mut r = ValidationReport::new("demo");
        r.check("x", 0, 1, 1);
        assert!(r.passed());
        assert_eq!(r.to_string(), "demo: PASS (1 words)");
        r.check("x", 1, 2, 3);
        assert!(!r.passed());
        assert_eq!(r.to_string(), "demo: fail 1/2");
        assert_eq!(r.mismatches[0].to_string(), "x[1]: expected 00000002, got 00000003");
    }
}
