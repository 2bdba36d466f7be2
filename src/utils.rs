pub fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub fn ewma(prev: Option<f64>, x: f64, alpha: f64) -> f64 {
    match prev {
        None => x,
        Some(p) => alpha * x + (1.0 - alpha) * p,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_seeds_from_first_sample() {
        assert_eq!(ewma(None, 5.0, 0.1), 5.0);
    }

    #[test]
    fn ewma_blends_toward_new_sample() {
        let v = ewma(Some(10.0), 0.0, 0.5);
        assert!((v - 5.0).abs() < 1e-9);
    }

}
