//! The 1-D per-streamline sub-problem and its solvers.
//!
//! Holding every other coefficient (and μ) fixed, the global cost as a
//! function of one streamline's coefficient `c` reduces to a sum over the
//! fixels that streamline traverses, plus its own regularisation terms.
//! All three solvers operate on the same [`LineSearchFunctor`] and respect
//! the caller's trust interval.

use crate::LineSearch;

/// Per-fixel terms of one streamline's 1-D cost function.
#[derive(Clone, Copy, Debug)]
pub struct FixelTerm {
    /// Processing weight of the fixel.
    pub weight: f64,
    /// Fibre density of the fixel.
    pub fd: f64,
    /// Track density contributed by every *other* streamline.
    pub td_other: f64,
    /// Length this streamline deposits in the fixel.
    pub length: f64,
    /// The fixel's mean-coefficient cache (total-variation anchor).
    pub mean_coeff: f64,
}

/// The global cost restricted to one streamline's coefficient.
pub struct LineSearchFunctor {
    terms: Vec<FixelTerm>,
    mu: f64,
    reg_tikhonov: f64,
    reg_tv: f64,
}

impl LineSearchFunctor {
    /// Assemble the functor from the streamline's fixel terms and the
    /// (already A-scaled) regularisation multipliers.
    #[must_use]
    pub fn new(terms: Vec<FixelTerm>, mu: f64, reg_tikhonov: f64, reg_tv: f64) -> Self {
        Self {
            terms,
            mu,
            reg_tikhonov,
            reg_tv,
        }
    }

    /// Cost at coefficient `c` (up to terms constant in `c`).
    #[must_use]
    pub fn cost(&self, c: f64) -> f64 {
        let factor = c.exp();
        let mut cost = self.reg_tikhonov * c * c;
        for t in &self.terms {
            let diff = self.mu * (t.td_other + factor * t.length) - t.fd;
            cost += t.weight * diff * diff;
            let dc = c - t.mean_coeff;
            cost += self.reg_tv * t.length * dc * dc;
        }
        cost
    }

    /// First derivative of the cost at `c`.
    #[must_use]
    pub fn derivative(&self, c: f64) -> f64 {
        let factor = c.exp();
        let mut d = 2.0 * self.reg_tikhonov * c;
        for t in &self.terms {
            let diff = self.mu * (t.td_other + factor * t.length) - t.fd;
            d += 2.0 * t.weight * self.mu * t.length * factor * diff;
            d += 2.0 * self.reg_tv * t.length * (c - t.mean_coeff);
        }
        d
    }

    /// Second derivative of the cost at `c`.
    #[must_use]
    pub fn second_derivative(&self, c: f64) -> f64 {
        let factor = c.exp();
        let mut d2 = 2.0 * self.reg_tikhonov;
        for t in &self.terms {
            let diff = self.mu * (t.td_other + factor * t.length) - t.fd;
            let slope = self.mu * t.length * factor;
            d2 += 2.0 * t.weight * (slope * diff + slope * slope);
            d2 += 2.0 * self.reg_tv * t.length;
        }
        d2
    }

    /// Minimise over `[lo, hi]` starting from `c0` with the requested
    /// solver; returns `c0` unchanged when no tested point improves on it.
    #[must_use]
    pub fn minimise(&self, c0: f64, lo: f64, hi: f64, solver: LineSearch) -> f64 {
        if !(lo < hi) {
            return c0;
        }
        let candidate = match solver {
            LineSearch::Newton => self.newton(c0, lo, hi),
            LineSearch::GoldenSection => self.golden_section(lo, hi),
            LineSearch::Quadratic => self.quadratic(c0, lo, hi),
        };
        let candidate = candidate.clamp(lo, hi);
        if candidate.is_finite() && self.cost(candidate) < self.cost(c0) {
            candidate
        } else {
            c0
        }
    }

    /// Bounded damped Newton iteration on the derivative.
    fn newton(&self, c0: f64, lo: f64, hi: f64) -> f64 {
        const MAX_ITERS: usize = 30;
        const TOL: f64 = 1e-8;
        let mut c = c0.clamp(lo, hi);
        for _ in 0..MAX_ITERS {
            let g = self.derivative(c);
            let h = self.second_derivative(c);
            let step = if h > 0.0 {
                -g / h
            } else {
                // Non-convex locally: descend a short fixed step.
                -0.1 * g.signum()
            };
            let next = (c + step).clamp(lo, hi);
            if (next - c).abs() < TOL {
                return next;
            }
            c = next;
        }
        c
    }

    /// Golden-section search over the full interval.
    fn golden_section(&self, lo: f64, hi: f64) -> f64 {
        const INV_PHI: f64 = 0.618_033_988_749_894_8;
        const TOL: f64 = 1e-6;
        let (mut a, mut b) = (lo, hi);
        let mut c = b - INV_PHI * (b - a);
        let mut d = a + INV_PHI * (b - a);
        let mut fc = self.cost(c);
        let mut fd = self.cost(d);
        while (b - a).abs() > TOL {
            if fc < fd {
                b = d;
                d = c;
                fd = fc;
                c = b - INV_PHI * (b - a);
                fc = self.cost(c);
            } else {
                a = c;
                c = d;
                fc = fd;
                d = a + INV_PHI * (b - a);
                fd = self.cost(d);
            }
        }
        0.5 * (a + b)
    }

    /// Iterated parabolic interpolation through three points.
    fn quadratic(&self, c0: f64, lo: f64, hi: f64) -> f64 {
        const MAX_ITERS: usize = 20;
        const TOL: f64 = 1e-8;
        let h = ((hi - lo) * 0.1).min(0.1).max(1e-4);
        let mut c = c0.clamp(lo, hi);
        for _ in 0..MAX_ITERS {
            let (xm, x0, xp) = ((c - h).max(lo), c, (c + h).min(hi));
            let (fm, f0, fp) = (self.cost(xm), self.cost(x0), self.cost(xp));
            // Vertex of the parabola through the three samples.
            let denom = (xm - x0) * (fm - fp) - (xm - xp) * (fm - f0);
            if denom.abs() < 1e-300 {
                return c;
            }
            let numer = (xm - x0).powi(2) * (fm - fp) - (xm - xp).powi(2) * (fm - f0);
            let vertex = xm - 0.5 * numer / denom;
            let next = vertex.clamp(lo, hi);
            if !next.is_finite() || (next - c).abs() < TOL {
                return if next.is_finite() { next } else { c };
            }
            c = next;
        }
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// One fixel, no regularisation: optimum where μ·F·l = fd, i.e.
    /// c = ln(fd / (μ·l)).
    fn simple_functor(mu: f64, fd: f64, length: f64) -> LineSearchFunctor {
        LineSearchFunctor::new(
            vec![FixelTerm {
                weight: 1.0,
                fd,
                td_other: 0.0,
                length,
                mean_coeff: 0.0,
            }],
            mu,
            0.0,
            0.0,
        )
    }

    #[test]
    fn all_solvers_find_the_analytic_optimum() {
        let f = simple_functor(0.5, 2.0, 1.0);
        let expected = (2.0_f64 / 0.5).ln();
        for solver in [
            LineSearch::Newton,
            LineSearch::GoldenSection,
            LineSearch::Quadratic,
        ] {
            let c = f.minimise(0.0, -5.0, 5.0, solver);
            assert_relative_eq!(c, expected, epsilon = 1e-3);
        }
    }

    #[test]
    fn derivative_is_zero_at_balance() {
        // td_other + F·l already equals fd/μ at c = 0.
        let f = LineSearchFunctor::new(
            vec![FixelTerm {
                weight: 1.0,
                fd: 1.0,
                td_other: 0.0,
                length: 1.0,
                mean_coeff: 0.0,
            }],
            1.0,
            0.0,
            0.0,
        );
        assert_relative_eq!(f.derivative(0.0), 0.0, epsilon = 1e-12);
        assert!(f.second_derivative(0.0) > 0.0);
    }

    #[test]
    fn degenerate_interval_returns_start() {
        let f = simple_functor(1.0, 1.0, 1.0);
        assert_eq!(f.minimise(0.3, 0.3, 0.3, LineSearch::Newton), 0.3);
    }

    #[test]
    fn tikhonov_pulls_towards_zero() {
        let free = simple_functor(0.5, 2.0, 1.0).minimise(0.0, -5.0, 5.0, LineSearch::Newton);
        let regularised = LineSearchFunctor::new(
            vec![FixelTerm {
                weight: 1.0,
                fd: 2.0,
                td_other: 0.0,
                length: 1.0,
                mean_coeff: 0.0,
            }],
            0.5,
            10.0,
            0.0,
        )
        .minimise(0.0, -5.0, 5.0, LineSearch::Newton);
        assert!(regularised.abs() < free.abs());
    }
}
