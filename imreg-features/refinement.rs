use imreg_core::{GrayImage, Keypoint};

/// Corner scoring, suppression and orientation helpers shared by the detectors
pub struct KeypointRefinement;

impl KeypointRefinement {
    /// Harris corner response `det(M) - k * trace(M)^2` over a square block centred on `(x, y)`
    pub fn harris_response(img: &GrayImage, x: u32, y: u32, block_size: u32, k: f32) -> f32 {
        let (w, h) = img.dimensions();
        let half = (block_size / 2) as i64;
        let px = |xx: i64, yy: i64| -> f32 {
            let cx = xx.clamp(0, w as i64 - 1) as u32;
            let cy = yy.clamp(0, h as i64 - 1) as u32;
            img.get_pixel(cx, cy)[0] as f32
        };

        let mut sxx = 0.0f32;
        let mut syy = 0.0f32;
        let mut sxy = 0.0f32;
        for dy in -half..=half {
            for dx in -half..=half {
                let cx = x as i64 + dx;
                let cy = y as i64 + dy;
                // 3x3 Sobel
                let gx = (px(cx + 1, cy - 1) + 2.0 * px(cx + 1, cy) + px(cx + 1, cy + 1))
                    - (px(cx - 1, cy - 1) + 2.0 * px(cx - 1, cy) + px(cx - 1, cy + 1));
                let gy = (px(cx - 1, cy + 1) + 2.0 * px(cx, cy + 1) + px(cx + 1, cy + 1))
                    - (px(cx - 1, cy - 1) + 2.0 * px(cx, cy - 1) + px(cx + 1, cy - 1));
                sxx += gx * gx;
                syy += gy * gy;
                sxy += gx * gy;
            }
        }

        // Keeps values in a float-friendly range
        let norm = 1.0 / (4.0 * block_size as f32 * 255.0);
        let (sxx, syy, sxy) = (sxx * norm * norm, syy * norm * norm, sxy * norm * norm);
        let det = sxx * syy - sxy * sxy;
        let trace = sxx + syy;
        det - k * trace * trace
    }

    /// Orientation by intensity centroid over a disc of the given radius
    pub fn compute_orientation(img: &GrayImage, x: f32, y: f32, radius: i32) -> f32 {
        let (w, h) = img.dimensions();
        let (cx, cy) = (x.round() as i32, y.round() as i32);
        let mut m10 = 0i64;
        let mut m01 = 0i64;
        let r2 = radius * radius;

        for dy in -radius..=radius {
            let yy = (cy + dy).clamp(0, h as i32 - 1) as u32;
            for dx in -radius..=radius {
                if dx * dx + dy * dy > r2 {
                    continue;
                }
                let xx = (cx + dx).clamp(0, w as i32 - 1) as u32;
                let val = img.get_pixel(xx, yy)[0] as i64;
                m10 += dx as i64 * val;
                m01 += dy as i64 * val;
            }
        }

        if m10 == 0 && m01 == 0 {
            0.0
        } else {
            (m01 as f32).atan2(m10 as f32)
        }
    }

    /// Non-maximum suppression to reduce duplicate keypoints.
    ///
    /// Output is ordered by decreasing response.
    pub fn non_maximum_suppression(keypoints: &[Keypoint], min_distance: f32) -> Vec<Keypoint> {
        if keypoints.is_empty() {
            return Vec::new();
        }

        let mut sorted_keypoints = keypoints.to_vec();
        sorted_keypoints.sort_by(|a, b| b.response.total_cmp(&a.response));

        let mut suppressed: Vec<Keypoint> = Vec::new();
        let min_distance_sq = min_distance * min_distance;

        for candidate in sorted_keypoints {
            let is_local_max = suppressed.iter().all(|existing| {
                let dx = candidate.x - existing.x;
                let dy = candidate.y - existing.y;
                dx * dx + dy * dy >= min_distance_sq
            });

            if is_local_max {
                suppressed.push(candidate);
            }
        }

        suppressed
    }

    /// Keep the `n` strongest keypoints (by absolute response) together with their rows.
    ///
    /// Relative order of the survivors is preserved.
    pub fn retain_best<T>(keypoints: Vec<Keypoint>, rows: Vec<T>, n: usize) -> (Vec<Keypoint>, Vec<T>) {
        if keypoints.len() <= n {
            return (keypoints, rows);
        }

        let mut order: Vec<usize> = (0..keypoints.len()).collect();
        order.sort_by(|&a, &b| {
            keypoints[b]
                .response
                .abs()
                .total_cmp(&keypoints[a].response.abs())
                .then(a.cmp(&b))
        });
        let mut keep = vec![false; keypoints.len()];
        for &i in order.iter().take(n) {
            keep[i] = true;
        }

        keypoints
            .into_iter()
            .zip(rows)
            .zip(keep)
            .filter_map(|(pair, k)| k.then_some(pair))
            .unzip()
    }
}
