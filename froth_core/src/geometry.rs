//! Contour measurements used by the blob detector.
use froth_traits::Point;

/// Polygon area by the shoelace formula (absolute value).
pub fn contour_area(points: &[Point]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut acc = 0.0f64;
    for (i, a) in points.iter().enumerate() {
        let b = points[(i + 1) % points.len()];
        acc += f64::from(a.x) * f64::from(b.y) - f64::from(b.x) * f64::from(a.y);
    }
    (acc * 0.5).abs()
}

/// Length of the closed polyline through `points`.
pub fn contour_perimeter(points: &[Point]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    points
        .iter()
        .enumerate()
        .map(|(i, a)| {
            let b = points[(i + 1) % points.len()];
            f64::from(b.x - a.x).hypot(f64::from(b.y - a.y))
        })
        .sum()
}

/// `4πA/P²`; 0 for a degenerate perimeter.
pub fn circularity(area: f64, perimeter: f64) -> f64 {
    if perimeter <= 0.0 {
        return 0.0;
    }
    4.0 * std::f64::consts::PI * area / (perimeter * perimeter)
}

/// Diameter of the circle with the same area.
pub fn equivalent_diameter(area: f64) -> f64 {
    2.0 * (area / std::f64::consts::PI).sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Circle {
    pub x: f64,
    pub y: f64,
    pub r: f64,
}

impl Circle {
    const EPS: f64 = 1e-7;

    fn contains(&self, p: (f64, f64)) -> bool {
        (p.0 - self.x).hypot(p.1 - self.y) <= self.r + Self::EPS * self.r.max(1.0)
    }

    fn from_two(a: (f64, f64), b: (f64, f64)) -> Self {
        Self {
            x: (a.0 + b.0) / 2.0,
            y: (a.1 + b.1) / 2.0,
            r: (a.0 - b.0).hypot(a.1 - b.1) / 2.0,
        }
    }

    fn from_three(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> Self {
        let d = 2.0 * (a.0 * (b.1 - c.1) + b.0 * (c.1 - a.1) + c.0 * (a.1 - b.1));
        if d.abs() < 1e-12 {
            // Collinear: the widest pair spans the others.
            return [Self::from_two(a, b), Self::from_two(a, c), Self::from_two(b, c)]
                .into_iter()
                .fold(Self::from_two(a, b), |best, c| if c.r > best.r { c } else { best });
        }
        let (a2, b2, c2) = (
            a.0 * a.0 + a.1 * a.1,
            b.0 * b.0 + b.1 * b.1,
            c.0 * c.0 + c.1 * c.1,
        );
        let x = (a2 * (b.1 - c.1) + b2 * (c.1 - a.1) + c2 * (a.1 - b.1)) / d;
        let y = (a2 * (c.0 - b.0) + b2 * (a.0 - c.0) + c2 * (b.0 - a.0)) / d;
        Self {
            x,
            y,
            r: (a.0 - x).hypot(a.1 - y),
        }
    }
}

/// Smallest circle enclosing every point (Welzl, iterative form).
///
/// Points are visited in a fixed pseudo-random order so results are
/// reproducible. Returns `None` for an empty slice.
pub fn min_enclosing_circle(points: &[Point]) -> Option<Circle> {
    let mut pts: Vec<(f64, f64)> = points
        .iter()
        .map(|p| (f64::from(p.x), f64::from(p.y)))
        .collect();
    let first = *pts.first()?;
    shuffle(&mut pts);

    let mut c = Circle {
        x: first.0,
        y: first.1,
        r: 0.0,
    };
    for i in 0..pts.len() {
        if c.contains(pts[i]) {
            continue;
        }
        c = Circle {
            x: pts[i].0,
            y: pts[i].1,
            r: 0.0,
        };
        for j in 0..i {
            if c.contains(pts[j]) {
                continue;
            }
            c = Circle::from_two(pts[i], pts[j]);
            for k in 0..j {
                if !c.contains(pts[k]) {
                    c = Circle::from_three(pts[i], pts[j], pts[k]);
                }
            }
        }
    }
    Some(c)
}

fn shuffle<T>(xs: &mut [T]) {
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    for i in (1..xs.len()).rev() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let j = (state % (i as u64 + 1)) as usize;
        xs.swap(i, j);
    }
}
