/// Clamp a gain into `[0, 1]`.  NaN maps to silence.
pub fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Playback volume for one channel after applying the global multiplier.
/// The product is clamped, not the factors.
pub fn effective_volume(channel_volume: f32, global_volume: f32) -> f32 {
    clamp_unit(channel_volume * global_volume)
}
