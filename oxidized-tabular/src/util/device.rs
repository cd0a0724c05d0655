#[cfg(test)]
pub(crate) mod tests {
    use candle_core::Device;

    /// Devices that layers and models are tested on.
    ///
    /// The CPU is always included, accelerators only when they are available.
    pub fn test_devices() -> Vec<Device> {
        std::iter::once(Device::Cpu)
            .chain(Device::new_cuda(0).ok())
            .chain(Device::new_metal(0).ok())
            .collect()
    }
}
