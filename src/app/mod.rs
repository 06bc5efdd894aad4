// Application boundaries: ports implemented by infrastructure adapters

pub mod ports;
