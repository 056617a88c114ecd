//! Device bundle
//!
//! [`AirDevice`] owns everything one host program needs: the queue, the
//! staging buffer, and (for the software backend) the fabric consuming the
//! queue. All addresses come from the injected [`HostConfig`].

use crate::backends::{BackendSelection, BackendType, HostMemoryMap, SoftwareFabric};
use crate::config::HostConfig;
use crate::dispatch;
use crate::error::Result;
use crate::memory::SharedMemory;
use crate::queue::{PacketRef, Queue};
use crate::wait::WaitPolicy;
use air_packet::Command;
use std::sync::Arc;
use tracing::info;

/// Queue, staging buffer and consumer of one AIR device
#[derive(Debug)]
pub struct AirDevice {
    // dropped first so the consumer stops before the regions go away
    fabric: Option<SoftwareFabric>,
    queue: Queue,
    staging: Arc<SharedMemory>,
    backend: BackendType,
    config: HostConfig,
}

impl AirDevice {
    /// Map the regions described by `config` and create the queue
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid, a region cannot be
    /// mapped, or queue creation fails.
    pub fn open(config: HostConfig, selection: BackendSelection) -> Result<Self> {
        config.validate()?;
        match selection {
            BackendSelection::Hardware => Self::open_hardware(config),
            BackendSelection::Software => Self::open_software(config),
            BackendSelection::Auto => match Self::open_hardware(config.clone()) {
                Ok(device) => Ok(device),
                Err(e) => {
                    info!("Hardware unavailable ({e}), using software fabric");
                    Self::open_software(config)
                }
            },
        }
    }

    fn open_hardware(config: HostConfig) -> Result<Self> {
        let queue_mem = SharedMemory::map_physical(
            &config.mem_device,
            config.queue_base,
            config.queue_region_size(),
        )?;
        let staging = SharedMemory::map_physical(
            &config.mem_device,
            config.staging_base,
            config.staging_size,
        )?;
        let queue = Queue::create(config.queue_capacity, config.queue_kind, Arc::new(queue_mem))?;
        info!("Opened AIR device on {}", config.mem_device.display());
        Ok(Self {
            fabric: None,
            queue,
            staging: Arc::new(staging),
            backend: BackendType::Hardware,
            config,
        })
    }

    fn open_software(config: HostConfig) -> Result<Self> {
        let queue_mem = Arc::new(SharedMemory::anonymous(
            config.queue_base,
            config.queue_region_size(),
        )?);
        let staging = Arc::new(SharedMemory::anonymous(
            config.staging_base,
            config.staging_size,
        )?);
        let queue = Queue::create(config.queue_capacity, config.queue_kind, Arc::clone(&queue_mem))?;
        let fabric = SoftwareFabric::spawn(
            queue_mem,
            HostMemoryMap::new().with_region(Arc::clone(&staging)),
        )?;
        info!("Opened software AIR device");
        Ok(Self {
            fabric: Some(fabric),
            queue,
            staging,
            backend: BackendType::Software,
            config,
        })
    }

    /// Effective configuration
    pub const fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Consumer serving the queue
    pub const fn backend_type(&self) -> BackendType {
        self.backend
    }

    /// Command queue
    pub const fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Staging buffer shared with the fabric
    pub const fn staging(&self) -> &Arc<SharedMemory> {
        &self.staging
    }

    /// Physical address of staging offset `offset`, for packet fields
    pub fn staging_addr(&self, offset: usize) -> u64 {
        self.staging.phys_addr(offset)
    }

    /// Software fabric, if that is the backend
    pub const fn fabric(&self) -> Option<&SoftwareFabric> {
        self.fabric.as_ref()
    }

    /// Reserve a slot and write `command`, without dispatching
    ///
    /// # Errors
    ///
    /// See [`dispatch::enqueue`].
    pub fn submit(&self, command: &Command) -> Result<PacketRef> {
        dispatch::enqueue(&self.queue, command, &WaitPolicy::indefinite())
    }

    /// Publish written packets up to and including `write_index`
    ///
    /// # Errors
    ///
    /// See [`dispatch::dispatch`].
    pub fn dispatch(&self, write_index: u64) -> Result<()> {
        dispatch::dispatch(&self.queue, write_index)?;
        if let Some(f) = &self.fabric {
            f.wake();
        }
        Ok(())
    }

    /// Publish and wait without a deadline
    ///
    /// # Errors
    ///
    /// See [`dispatch::dispatch_and_wait`].
    pub fn dispatch_and_wait(&self, write_index: u64, packet: PacketRef) -> Result<()> {
        self.dispatch_and_wait_with(write_index, packet, &WaitPolicy::indefinite())
    }

    /// Publish and wait under `policy`
    ///
    /// # Errors
    ///
    /// See [`dispatch::dispatch_and_wait_with`].
    pub fn dispatch_and_wait_with(
        &self,
        write_index: u64,
        packet: PacketRef,
        policy: &WaitPolicy,
    ) -> Result<()> {
        self.dispatch(write_index)?;
        dispatch::dispatch_and_wait_with(&self.queue, write_index, packet, policy)
    }

    /// Submit `commands` back to back, dispatch once and wait on the last
    ///
    /// Returns the packet handles in submission order.
    ///
    /// # Errors
    ///
    /// Returns the first submission or wait error.
    pub fn run_batch(&self, commands: &[Command], policy: &WaitPolicy) -> Result<Vec<PacketRef>> {
        let packets = commands
            .iter()
            .map(|c| self.submit(c))
            .collect::<Result<Vec<_>>>()?;
        if let Some(&last) = packets.last() {
            self.dispatch_and_wait_with(last.index(), last, policy)?;
        }
        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use air_packet::{DeviceInit, HerdInit};

    fn software() -> AirDevice {
        AirDevice::open(HostConfig::default().with_queue_capacity(8), BackendSelection::Software)
            .unwrap()
    }

    #[test]
    fn test_software_device_runs_batch() {
        let dev = software();
        assert_eq!(dev.backend_type(), BackendType::Software);
        assert_eq!(dev.queue().capacity(), 8);

        let cmds = [
            Command::HerdInit(HerdInit {
                herd_id: 0,
                start_column: 7,
                num_columns: 1,
                start_row: 0,
                num_rows: 3,
            }),
            Command::DeviceInit(DeviceInit { num_columns: 50 }),
        ];
        let pkts = dev.run_batch(&cmds, &WaitPolicy::indefinite()).unwrap();
        assert_eq!(pkts.len(), 2);
        assert!(dev.queue().is_complete(pkts[0].index()).unwrap());
        assert_eq!(dev.fabric().unwrap().status().device_columns, Some(50));
    }

    #[test]
    fn test_queue_wraps_many_times() {
        let dev = software();
        let cmd = Command::DeviceInit(DeviceInit { num_columns: 1 });
        for _ in 0..40 {
            let pkt = dev.submit(&cmd).unwrap();
            dev.dispatch_and_wait(pkt.index(), pkt).unwrap();
        }
        assert_eq!(dev.queue().read_index().unwrap(), 40);
        assert_eq!(dev.queue().write_index().unwrap(), 40);
    }

    #[test]
    fn test_wait_on_done_packet_publishes_later_ones() {
        let dev = software();
        let cmd = Command::DeviceInit(DeviceInit { num_columns: 3 });
        let first = dev.submit(&cmd).unwrap();
        dev.dispatch_and_wait(first.index(), first).unwrap();

        let second = dev.submit(&cmd).unwrap();
        dev.dispatch_and_wait(second.index(), first).unwrap();
        assert_eq!(dev.queue().published().unwrap(), 2);
        dispatch::wait(dev.queue(), second, &WaitPolicy::bounded(std::time::Duration::from_secs(5)))
            .unwrap();
    }

    #[test]
    fn test_staging_addresses() {
        let dev = software();
        assert_eq!(dev.staging_addr(0), dev.config().staging_base);
        assert_eq!(dev.staging_addr(0x80), dev.config().staging_base + 0x80);
        assert_eq!(dev.staging().size(), dev.config().staging_size);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = HostConfig::default().with_queue_capacity(48);
        assert!(AirDevice::open(cfg, BackendSelection::Software).is_err());
    }

    #[test]
    fn test_auto_falls_back_to_software() {
        let cfg = HostConfig {
            mem_device: "/nonexistent/air-mem".into(),
            ..HostConfig::default().with_queue_capacity(4)
        };
        let dev = AirDevice::open(cfg, BackendSelection::Auto).unwrap();
        assert_eq!(dev.backend_type(), BackendType::Software);
    }

    #[test]
    #[ignore] // Requires hardware
    fn test_hardware_queue_header() {
        let dev = AirDevice::open(HostConfig::from_env().unwrap(), BackendSelection::Hardware)
            .unwrap();
        let header = dev.queue().header().unwrap();
        assert_eq!(header.size, dev.config().queue_capacity);
    }
}
