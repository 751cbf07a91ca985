//! Closed contour extraction from a binary edge map.
//!
//! Edge pixels are grouped into 8-connected components and the outer
//! boundary of each component is walked with Moore-neighbour tracing.

use std::collections::VecDeque;

use super::edges::EdgeMask;

/// Clockwise Moore neighbourhood in (row, col) offsets, starting west.
const MOORE: [(isize, isize); 8] = [
    (0, -1),
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
    (1, 0),
    (1, -1),
];

/// Outer boundary of one edge component, in (row, col) pixel coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Contour {
    pub points: Vec<(usize, usize)>,
}

impl Contour {
    /// Enclosed area by the shoelace formula over pixel centers.
    pub fn area(&self) -> f64 {
        let n = self.points.len();
        if n < 3 {
            return 0.0;
        }
        let mut twice = 0.0;
        for i in 0..n {
            let (r0, c0) = self.points[i];
            let (r1, c1) = self.points[(i + 1) % n];
            twice += c0 as f64 * r1 as f64 - c1 as f64 * r0 as f64;
        }
        twice.abs() / 2.0
    }

    /// Pixels on or inside the boundary.
    ///
    /// The background is flooded 4-connected from outside the bounding box,
    /// so diagonal steps of the 8-connected trace never leak.
    pub fn filled_area(&self) -> usize {
        let Some(&(r0, c0)) = self.points.first() else {
            return 0;
        };
        let (mut top, mut left, mut bottom, mut right) = (r0, c0, r0, c0);
        for &(r, c) in &self.points {
            top = top.min(r);
            left = left.min(c);
            bottom = bottom.max(r);
            right = right.max(c);
        }

        // One cell of padding on every side
        let w = right - left + 3;
        let h = bottom - top + 3;
        let mut wall = vec![false; w * h];
        for &(r, c) in &self.points {
            wall[(r - top + 1) * w + (c - left + 1)] = true;
        }

        let mut outside = vec![false; w * h];
        let mut queue = VecDeque::from([0usize]);
        outside[0] = true;
        let mut reached = 1;
        while let Some(i) = queue.pop_front() {
            let (r, c) = (i / w, i % w);
            let neighbours = [
                (r > 0).then(|| i - w),
                (r + 1 < h).then(|| i + w),
                (c > 0).then(|| i - 1),
                (c + 1 < w).then(|| i + 1),
            ];
            for j in neighbours.into_iter().flatten() {
                if !wall[j] && !outside[j] {
                    outside[j] = true;
                    reached += 1;
                    queue.push_back(j);
                }
            }
        }

        w * h - reached
    }

    /// Chain length of the closed trace; diagonal steps count √2.
    pub fn perimeter(&self) -> f64 {
        let n = self.points.len();
        if n < 2 {
            return 0.0;
        }
        (0..n)
            .map(|i| {
                let (r0, c0) = self.points[i];
                let (r1, c1) = self.points[(i + 1) % n];
                if r0 != r1 && c0 != c1 {
                    std::f64::consts::SQRT_2
                } else {
                    1.0
                }
            })
            .sum()
    }

    /// Mean of the boundary points as (row, col).
    pub fn center(&self) -> (f64, f64) {
        if self.points.is_empty() {
            return (0.0, 0.0);
        }
        let n = self.points.len() as f64;
        let (sr, sc) = self
            .points
            .iter()
            .fold((0.0, 0.0), |(sr, sc), &(r, c)| (sr + r as f64, sc + c as f64));
        (sr / n, sc / n)
    }
}

/// Label 8-connected components of the edge map.
///
/// Returns the label grid (`0` is background, components count from `1`)
/// and the number of components.
pub fn label_components(mask: &EdgeMask) -> (Vec<u32>, u32) {
    let (w, h) = (mask.width, mask.height);
    let mut labels = vec![0u32; w * h];
    let mut next = 0u32;
    let mut queue = VecDeque::new();

    for start in 0..w * h {
        if !mask.data[start] || labels[start] != 0 {
            continue;
        }
        next += 1;
        labels[start] = next;
        queue.push_back(start);

        while let Some(i) = queue.pop_front() {
            let (r, c) = ((i / w) as isize, (i % w) as isize);
            for &(dr, dc) in &MOORE {
                let (nr, nc) = (r + dr, c + dc);
                if nr < 0 || nc < 0 || nr >= h as isize || nc >= w as isize {
                    continue;
                }
                let j = nr as usize * w + nc as usize;
                if mask.data[j] && labels[j] == 0 {
                    labels[j] = next;
                    queue.push_back(j);
                }
            }
        }
    }

    (labels, next)
}

/// Trace the outer boundary of every component.
pub fn find_contours(mask: &EdgeMask) -> Vec<Contour> {
    let (labels, count) = label_components(mask);
    let w = mask.width;

    // First pixel in raster order of each component lies on its outer boundary
    let mut starts = vec![None; count as usize + 1];
    let mut sizes = vec![0usize; count as usize + 1];
    for (i, &label) in labels.iter().enumerate() {
        if label == 0 {
            continue;
        }
        sizes[label as usize] += 1;
        if starts[label as usize].is_none() {
            starts[label as usize] = Some((i / w, i % w));
        }
    }

    (1..=count as usize)
        .filter_map(|label| {
            let start = starts[label]?;
            Some(trace_boundary(
                &labels,
                mask.width,
                mask.height,
                label as u32,
                start,
                sizes[label],
            ))
        })
        .collect()
}

fn direction_of(from: (isize, isize), to: (isize, isize)) -> usize {
    let d = (to.0 - from.0, to.1 - from.1);
    MOORE.iter().position(|&m| m == d).unwrap_or(0)
}

/// Moore-neighbour trace with Jacob's stopping criterion.
///
/// The walk ends when it is back at `start` about to repeat its first move.
/// An iteration cap bounds pathological components.
fn trace_boundary(
    labels: &[u32],
    width: usize,
    height: usize,
    label: u32,
    start: (usize, usize),
    size: usize,
) -> Contour {
    let inside = |(r, c): (isize, isize)| -> bool {
        r >= 0
            && c >= 0
            && (r as usize) < height
            && (c as usize) < width
            && labels[r as usize * width + c as usize] == label
    };

    let start = (start.0 as isize, start.1 as isize);
    let mut points = vec![start];
    let mut current = start;
    // West of the first raster-order pixel is never part of the component
    let mut backtrack = (start.0, start.1 - 1);
    let max_steps = 4 * size + 16;

    for _ in 0..max_steps {
        let k = direction_of(current, backtrack);
        let mut found = None;
        for i in 1..=8 {
            let d = (k + i) % 8;
            let candidate = (current.0 + MOORE[d].0, current.1 + MOORE[d].1);
            if inside(candidate) {
                let prev = (k + i - 1) % 8;
                found = Some((candidate, (current.0 + MOORE[prev].0, current.1 + MOORE[prev].1)));
                break;
            }
        }

        let Some((next, next_backtrack)) = found else {
            // Isolated pixel
            break;
        };

        if current == start && points.len() > 1 && next == points[1] {
            break;
        }

        points.push(next);
        backtrack = next_backtrack;
        current = next;
    }

    // Closing return to the start is implied
    if points.len() > 1 && points.last() == Some(&start) {
        points.pop();
    }

    Contour {
        points: points
            .into_iter()
            .map(|(r, c)| (r as usize, c as usize))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_from(rows: &[&str]) -> EdgeMask {
        let h = rows.len();
        let w = rows[0].len();
        let mut mask = EdgeMask::new(w, h);
        for (y, row) in rows.iter().enumerate() {
            for (x, ch) in row.chars().enumerate() {
                mask.set(x, y, ch == '#');
            }
        }
        mask
    }

    #[test]
    fn test_label_components() {
        let mask = mask_from(&["##..#", "#...#", "....#", ".#..."]);
        let (labels, count) = label_components(&mask);
        assert_eq!(count, 3);
        assert_eq!(labels[0], labels[5]);
        assert_ne!(labels[0], labels[4]);
    }

    #[test]
    fn test_diagonal_pixels_connect() {
        let mask = mask_from(&["#..", ".#.", "..#"]);
        assert_eq!(label_components(&mask).1, 1);
    }

    #[test]
    fn test_square_ring_trace() {
        let mask = mask_from(&[
            ".......", //
            ".#####.", //
            ".#...#.", //
            ".#...#.", //
            ".#...#.", //
            ".#####.", //
            ".......",
        ]);
        let contours = find_contours(&mask);
        assert_eq!(contours.len(), 1);

        let contour = &contours[0];
        assert_eq!(contour.points.len(), 16);
        assert_eq!(contour.points[0], (1, 1));
        assert!((contour.area() - 16.0).abs() < 1e-9);
        assert_eq!(contour.filled_area(), 25);
        assert!((contour.perimeter() - 16.0).abs() < 1e-9);
        assert_eq!(contour.center(), (3.0, 3.0));
    }

    #[test]
    fn test_filled_block_traces_outline_only() {
        let mask = mask_from(&["....", ".##.", ".##.", "...."]);
        let contours = find_contours(&mask);
        assert_eq!(contours.len(), 1);
        assert_eq!(contours[0].points, vec![(1, 1), (1, 2), (2, 2), (2, 1)]);
        assert!((contours[0].area() - 1.0).abs() < 1e-9);
        assert_eq!(contours[0].filled_area(), 4);
    }

    #[test]
    fn test_single_pixel_has_no_area() {
        let mask = mask_from(&["...", ".#.", "..."]);
        let contours = find_contours(&mask);
        assert_eq!(contours.len(), 1);
        assert_eq!(contours[0].points, vec![(1, 1)]);
        assert_eq!(contours[0].area(), 0.0);
        assert_eq!(contours[0].filled_area(), 1);
        assert_eq!(contours[0].perimeter(), 0.0);
    }

    #[test]
    fn test_diamond_perimeter_uses_diagonals() {
        let mask = mask_from(&[
            ".....", //
            "..#..", //
            ".#.#.", //
            "..#..", //
            ".....",
        ]);
        let contours = find_contours(&mask);
        assert_eq!(contours.len(), 1);
        let c = &contours[0];
        assert_eq!(c.points.len(), 4);
        assert!((c.perimeter() - 4.0 * std::f64::consts::SQRT_2).abs() < 1e-9);
        assert!((c.area() - 2.0).abs() < 1e-9);
        // Four rim pixels plus the enclosed centre
        assert_eq!(c.filled_area(), 5);
    }

    #[test]
    fn test_contour_touching_border() {
        let mask = mask_from(&["###", "#.#", "###"]);
        let contours = find_contours(&mask);
        assert_eq!(contours.len(), 1);
        assert_eq!(contours[0].points.len(), 8);
        assert!((contours[0].area() - 4.0).abs() < 1e-9);
        assert_eq!(contours[0].filled_area(), 9);
    }

    #[test]
    fn test_filled_area_of_traced_disc_ring() {
        // Ring of pixels between radius 7.5 and 8.5 around (10, 10)
        let mut mask = EdgeMask::new(21, 21);
        for y in 0..21 {
            for x in 0..21 {
                let d = ((y as f64 - 10.0).powi(2) + (x as f64 - 10.0).powi(2)).sqrt();
                mask.set(x, y, (7.5..8.5).contains(&d));
            }
        }
        let contours = find_contours(&mask);
        assert_eq!(contours.len(), 1);

        let c = &contours[0];
        let filled = c.filled_area() as f64;
        let disc = std::f64::consts::PI * 8.5 * 8.5;
        assert!((filled - disc).abs() / disc < 0.05, "filled {}", filled);
        assert!(filled > c.area());
    }
}
