/// Golden-angle hue rotation in degrees. Successive assignments land far
/// apart on the hue wheel, so nearby experiments never share a hue the way
/// pure random assignment can.
const GOLDEN_ANGLE_DEG: f64 = 137.507_764_05;

/// Returns the color for the n-th assigned experiment as a CSS HSL string.
pub fn palette_color(index: usize) -> String {
    let hue = (index as f64 * GOLDEN_ANGLE_DEG) % 360.0;
    format!("hsl({hue:.1}, 70%, 50%)")
}
