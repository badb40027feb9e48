use crate::reduction::ReducedMechanism;
use crate::traits::{Integrator, Kinetics};
use anyhow::{bail, Result};

/// Fixed-step classic Runge-Kutta integrator over the reduced system.
///
/// Reference implementation for tests and demos; production callers plug a
/// stiff solver behind the [`Integrator`] seam instead.
pub struct Rk4 {
    substeps: usize,
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    tmp: Vec<f64>,
}

impl Rk4 {
    pub fn new(dim: usize, substeps: usize) -> Self {
        Self {
            substeps: substeps.max(1),
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }
}

impl<K: Kinetics> Integrator<K> for Rk4 {
    fn integrate(
        &mut self,
        kinetics: &K,
        reduced: &ReducedMechanism,
        c: &mut [f64],
        t: f64,
        p: f64,
        _t0: f64,
        dt: f64,
    ) -> Result<()> {
        if c.len() != self.k1.len() {
            bail!("state buffer has incorrect dimension");
        }
        let disabled = Some(reduced.reactions_disabled.as_slice());
        let h = dt / self.substeps as f64;
        let sixth = h / 6.0;

        for _ in 0..self.substeps {
            // disabled reactions give inactive species a zero rate, so they
            // stay frozen through the whole substep
            kinetics.net_rates(c, t, p, disabled, &mut self.k1);

            for i in 0..c.len() {
                self.tmp[i] = c[i] + 0.5 * h * self.k1[i];
            }
            kinetics.net_rates(&self.tmp, t, p, disabled, &mut self.k2);

            for i in 0..c.len() {
                self.tmp[i] = c[i] + 0.5 * h * self.k2[i];
            }
            kinetics.net_rates(&self.tmp, t, p, disabled, &mut self.k3);

            for i in 0..c.len() {
                self.tmp[i] = c[i] + h * self.k3[i];
            }
            kinetics.net_rates(&self.tmp, t, p, disabled, &mut self.k4);

            for i in 0..c.len() {
                c[i] += sixth * (self.k1[i] + 2.0 * self.k2[i] + 2.0 * self.k3[i] + self.k4[i]);
            }
            if c.iter().any(|v| !v.is_finite()) {
                bail!("non-finite concentration during chemistry substep");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Rk4;
    use crate::mechanism::{Arrhenius, Mechanism};
    use crate::reduction::ReducedMechanism;
    use crate::traits::Integrator;

    fn decay_mechanism(rate: f64) -> Mechanism {
        let mut mech = Mechanism::new();
        mech.add_specie("A", 20.0, &[("H", 2)]).unwrap();
        mech.add_specie("B", 20.0, &[("H", 2)]).unwrap();
        mech.add_reaction(
            &[("A", 1.0)],
            &[("B", 1.0)],
            Arrhenius {
                a: rate,
                beta: 0.0,
                e_a: 0.0,
            },
            None,
        )
        .unwrap();
        mech
    }

    #[test]
    fn matches_the_exponential_solution() {
        let mech = decay_mechanism(100.0);
        let reduced = ReducedMechanism::identity(2, 1);
        let mut rk4 = Rk4::new(2, 50);
        let mut c = [1.0, 0.0];
        rk4.integrate(&mech, &reduced, &mut c, 1000.0, 101_325.0, 0.0, 0.01)
            .unwrap();

        let expected = (-1.0_f64).exp();
        assert!((c[0] - expected).abs() < 1e-8, "c_A = {}", c[0]);
        assert!((c[0] + c[1] - 1.0).abs() < 1e-12, "mass is conserved");
    }

    #[test]
    fn frozen_species_keep_their_concentration() {
        let mech = decay_mechanism(100.0);
        let mut reduced = ReducedMechanism::identity(2, 1);
        // disable the only reaction: nothing may move
        reduced.reactions_disabled[0] = true;
        let mut rk4 = Rk4::new(2, 10);
        let mut c = [0.7, 0.3];
        rk4.integrate(&mech, &reduced, &mut c, 1000.0, 101_325.0, 0.0, 0.01)
            .unwrap();
        assert_eq!(c, [0.7, 0.3]);
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let mech = decay_mechanism(1.0);
        let reduced = ReducedMechanism::identity(2, 1);
        let mut rk4 = Rk4::new(3, 1);
        let mut c = [1.0, 0.0];
        let err = rk4
            .integrate(&mech, &reduced, &mut c, 1000.0, 101_325.0, 0.0, 0.01)
            .expect_err("dimension mismatch");
        assert!(format!("{err}").contains("dimension"));
    }
}
