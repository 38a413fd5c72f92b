/*!
# Fleet DevKit - stubs and helpers for kernel tests

- `MockBus`: in-memory bus publisher, records everything instead of talking to a broker
- `TestHarness`: a kernel with seeded scooters and stations, embedded devices and fast motion
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{BusMessage, MockBus};
pub use test_utils::{scooter, station, test_config, TestHarness};
