//! Run AIM end-to-end on a small synthetic census-style table and report
//! the workload error of the generated rows.

use dpsynth::{Aim, AimOptions, Clique, Dataset, Domain};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn main() -> dpsynth::Result<()> {
    let domain = Domain::new(["age", "income", "edu", "sex"], vec![8, 6, 4, 2])?;
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let records = (0..2000)
        .map(|_| {
            let age = rng.gen_range(0..8usize);
            let edu = (age / 2 + rng.gen_range(0..2usize)).min(3);
            let income = (edu + rng.gen_range(0..3usize)).min(5);
            let sex = rng.gen_range(0..2usize);
            vec![age, income, edu, sex]
        })
        .collect();
    let data = Dataset::from_rows(domain, records)?;

    // All two-way marginals, equally weighted.
    let attrs = data.domain().attrs();
    let mut workload = Vec::new();
    for i in 0..attrs.len() {
        for j in i + 1..attrs.len() {
            workload.push((Clique::new([attrs[i].clone(), attrs[j].clone()]), 1.0));
        }
    }

    let mech = Aim::new(1.0, 1e-9)?
        .with_max_model_size(20.0)
        .with_max_iters(200);
    let run = mech.run(&data, &workload, AimOptions::default(), &mut rng)?;

    let n = data.len() as f64;
    let m = run.synthetic.len() as f64;
    let mut errors = Vec::new();
    for (cl, wgt) in &workload {
        let real = data.project(cl)?.datavector();
        let synth = run.synthetic.project(cl)?.datavector();
        let l1: f64 = real
            .iter()
            .zip(synth.iter())
            .map(|(a, b)| (a / n - b / m).abs())
            .sum();
        errors.push(0.5 * wgt * l1);
    }
    let avg = errors.iter().sum::<f64>() / errors.len() as f64;

    println!("rho budget:        {:.4}", mech.rho());
    println!("rho used:          {:.4}", run.budget.used());
    println!("measurements:      {}", run.measurements.len());
    println!("synthetic rows:    {}", run.synthetic.len());
    println!("avg workload error: {avg:.4}");
    Ok(())
}
