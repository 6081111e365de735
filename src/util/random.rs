use rand::RngCore;
#[cfg(test)] use std::sync::Mutex;

/// expectations on [MockRandom]'s static methods are global - tests setting them hold this lock
#[cfg(test)]
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Where message ids and peer ids come from. The methods are static so that code can be
///  parameterized with a mock without passing an instance around.
#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn message_id() -> u32;
    fn fill_bytes(buf: &mut [u8]);
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn message_id() -> u32 {
        rand::thread_rng().next_u32()
    }

    fn fill_bytes(buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf)
    }
}
