pub mod capture;
pub mod playback;

#[cfg(test)]
pub(crate) mod scripted;
