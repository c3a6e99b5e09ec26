use num::complex::Complex64;
use strata_math::{Matrix, Vector};

type Vec3 = Vector<f64, 3>;
type Mat3 = Matrix<f64, 3, 3>;

/// Real roots of the quartic A x^4 + B x^3 + C x^2 + D x + E by the
/// closed-form resolvent; the real parts of the four complex roots are
/// returned.
fn solve_quartic_roots(factors: &[f64; 5]) -> [f64; 4] {
    let a = factors[0];
    let b = factors[1];
    let c = factors[2];
    let d = factors[3];
    let e = factors[4];

    let a2 = a * a;
    let b2 = b * b;
    let a3 = a2 * a;
    let b3 = b2 * b;
    let a4 = a3 * a;
    let b4 = b3 * b;

    let alpha = -3.0 * b2 / (8.0 * a2) + c / a;
    let beta = b3 / (8.0 * a3) - b * c / (2.0 * a2) + d / a;
    let gamma =
        -3.0 * b4 / (256.0 * a4) + b2 * c / (16.0 * a3) - b * d / (4.0 * a2) + e / a;

    let alpha2 = alpha * alpha;
    let alpha3 = alpha2 * alpha;
    let beta2 = beta * beta;

    let p = Complex64::new(-alpha2 / 12.0 - gamma, 0.0);
    let q = Complex64::new(-alpha3 / 108.0 + alpha * gamma / 3.0 - beta2 / 8.0, 0.0);
    let r = -q / 2.0 + (q * q / 4.0 + p * p * p / 27.0).sqrt();

    let u = r.powf(1.0 / 3.0);
    let y = if u.re == 0.0 {
        Complex64::new(-5.0 * alpha / 6.0, 0.0) - q.powf(1.0 / 3.0)
    } else {
        Complex64::new(-5.0 * alpha / 6.0, 0.0) - p / (3.0 * u) + u
    };

    let w = (Complex64::new(alpha, 0.0) + 2.0 * y).sqrt();
    let part1 = Complex64::new(-b / (4.0 * a), 0.0);
    let part2 = Complex64::new(3.0 * alpha, 0.0) + 2.0 * y;
    let part3 = Complex64::new(2.0 * beta, 0.0) / w;

    [
        (part1 + 0.5 * (w + (-(part2 + part3)).sqrt())).re,
        (part1 + 0.5 * (w - (-(part2 + part3)).sqrt())).re,
        (part1 + 0.5 * (-w + (-(part2 - part3)).sqrt())).re,
        (part1 + 0.5 * (-w - (-(part2 - part3)).sqrt())).re,
    ]
}

fn matrix_from_rows(r0: Vec3, r1: Vec3, r2: Vec3) -> Mat3 {
    let mut out = Mat3::zero();
    out.set_row(0, &r0);
    out.set_row(1, &r1);
    out.set_row(2, &r2);
    out
}

/// Computes up to four camera poses [R|t] from three 2D-3D
/// correspondences, given as world points p1..p3 and unit direction
/// vectors f1..f3 in camera coordinates.
///
/// Reference: Kneip, Scaramuzza, Siegwart, "A Novel Parametrization of
/// the Perspective-Three-Point Problem" (CVPR 2011). Colinear world
/// points yield an empty solution set.
pub fn pose_p3p_kneip(
    mut p1: Vec3,
    mut p2: Vec3,
    p3: Vec3,
    mut f1: Vec3,
    mut f2: Vec3,
    mut f3: Vec3,
) -> Vec<Matrix<f64, 3, 4>> {
    // Colinear points admit no unique solution.
    let colinear_threshold = 1e-10;
    if (p2 - p1).cross(&(p3 - p1)).square_norm() < colinear_threshold {
        return Vec::new();
    }

    // Normalize the directions if necessary.
    let normalize_epsilon = 1e-10;
    if (f1.square_norm() - 1.0).abs() > normalize_epsilon {
        f1 = f1.normalized();
    }
    if (f2.square_norm() - 1.0).abs() > normalize_epsilon {
        f2 = f2.normalized();
    }
    if (f3.square_norm() - 1.0).abs() > normalize_epsilon {
        f3 = f3.normalized();
    }

    // Intermediate camera frame.
    let mut t;
    {
        let e1 = f1;
        let e3 = f1.cross(&f2).normalized();
        let e2 = e3.cross(&e1);
        t = matrix_from_rows(e1, e2, e3);
        f3 = t * f3;
    }

    // Reorder the correspondences if f3 points to the positive half.
    if f3[2] > 0.0 {
        std::mem::swap(&mut p1, &mut p2);
        std::mem::swap(&mut f1, &mut f2);

        let e1 = f1;
        let e3 = f1.cross(&f2).normalized();
        let e2 = e3.cross(&e1);
        t = matrix_from_rows(e1, e2, e3);
        f3 = t * f3;
    }

    // Intermediate world frame.
    let n;
    {
        let n1 = (p2 - p1).normalized();
        let n3 = n1.cross(&(p3 - p1)).normalized();
        let n2 = n3.cross(&n1);
        n = matrix_from_rows(n1, n2, n3);
    }
    let p3 = n * (p3 - p1);

    // Known parameters.
    let d_12 = (p2 - p1).norm();
    let f_1 = f3[0] / f3[2];
    let f_2 = f3[1] / f3[2];
    let p_1 = p3[0];
    let p_2 = p3[1];

    let cos_beta = f1.dot(&f2);
    let mut b = 1.0 / (1.0 - cos_beta * cos_beta) - 1.0;
    b = if cos_beta < 0.0 { -b.sqrt() } else { b.sqrt() };

    let f_1_pw2 = f_1 * f_1;
    let f_2_pw2 = f_2 * f_2;
    let p_1_pw2 = p_1 * p_1;
    let p_1_pw3 = p_1_pw2 * p_1;
    let p_1_pw4 = p_1_pw3 * p_1;
    let p_2_pw2 = p_2 * p_2;
    let p_2_pw3 = p_2_pw2 * p_2;
    let p_2_pw4 = p_2_pw3 * p_2;
    let d_12_pw2 = d_12 * d_12;
    let b_pw2 = b * b;

    // Coefficients of the fourth degree polynomial.
    let factors = [
        -f_2_pw2 * p_2_pw4 - p_2_pw4 * f_1_pw2 - p_2_pw4,
        2.0 * p_2_pw3 * d_12 * b + 2.0 * f_2_pw2 * p_2_pw3 * d_12 * b
            - 2.0 * f_2 * p_2_pw3 * f_1 * d_12,
        -f_2_pw2 * p_2_pw2 * p_1_pw2 - f_2_pw2 * p_2_pw2 * d_12_pw2 * b_pw2
            - f_2_pw2 * p_2_pw2 * d_12_pw2
            + f_2_pw2 * p_2_pw4
            + p_2_pw4 * f_1_pw2
            + 2.0 * p_1 * p_2_pw2 * d_12
            + 2.0 * f_1 * f_2 * p_1 * p_2_pw2 * d_12 * b
            - p_2_pw2 * p_1_pw2 * f_1_pw2
            + 2.0 * p_1 * p_2_pw2 * f_2_pw2 * d_12
            - p_2_pw2 * d_12_pw2 * b_pw2
            - 2.0 * p_1_pw2 * p_2_pw2,
        2.0 * p_1_pw2 * p_2 * d_12 * b + 2.0 * f_2 * p_2_pw3 * f_1 * d_12
            - 2.0 * f_2_pw2 * p_2_pw3 * d_12 * b
            - 2.0 * p_1 * p_2 * d_12_pw2 * b,
        -2.0 * f_2 * p_2_pw2 * f_1 * p_1 * d_12 * b
            + f_2_pw2 * p_2_pw2 * d_12_pw2
            + 2.0 * p_1_pw3 * d_12
            - p_1_pw2 * d_12_pw2
            + f_2_pw2 * p_2_pw2 * p_1_pw2
            - p_1_pw4
            - 2.0 * f_2_pw2 * p_2_pw2 * p_1 * d_12
            + p_2_pw2 * f_1_pw2 * p_1_pw2
            + f_2_pw2 * p_2_pw2 * d_12_pw2 * b_pw2,
    ];

    let real_roots = solve_quartic_roots(&factors);

    // Back-substitution of each root.
    let mut solutions = Vec::with_capacity(4);
    for root in real_roots {
        let cot_alpha =
            (-f_1 * p_1 / f_2 - root * p_2 + d_12 * b) / (-f_1 * root * p_2 / f_2 + p_1 - d_12);

        let cos_theta = root;
        let sin_theta = (1.0 - root * root).sqrt();
        let sin_alpha = (1.0 / (cot_alpha * cot_alpha + 1.0)).sqrt();
        let mut cos_alpha = (1.0 - sin_alpha * sin_alpha).sqrt();
        if cot_alpha < 0.0 {
            cos_alpha = -cos_alpha;
        }

        let mut c = Vec3::new([
            d_12 * cos_alpha * (sin_alpha * b + cos_alpha),
            cos_theta * d_12 * sin_alpha * (sin_alpha * b + cos_alpha),
            sin_theta * d_12 * sin_alpha * (sin_alpha * b + cos_alpha),
        ]);
        c = p1 + n.transposed() * c;

        let r = Mat3::new([
            [-cos_alpha, -sin_alpha * cos_theta, -sin_alpha * sin_theta],
            [sin_alpha, -cos_alpha * cos_theta, -cos_alpha * sin_theta],
            [0.0, -sin_theta, cos_theta],
        ]);
        let r = n.transposed() * r.transposed() * t;

        // Camera position and cam-to-world rotation to pose.
        let r = r.transposed();
        let c = -(r * c);

        solutions.push(r.hstack(&c));
    }
    solutions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose_matrix(angle: f64) -> Matrix<f64, 3, 4> {
        // Rotation around the y-axis with zero translation.
        let (s, c) = angle.sin_cos();
        Matrix::new([
            [c, 0.0, s, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [-s, 0.0, c, 0.0],
        ])
    }

    fn transform(pose: &Matrix<f64, 3, 4>, p: &Vec3) -> Vec3 {
        let hom = Vector::new([p[0], p[1], p[2], 1.0]);
        *pose * hom
    }

    #[test]
    fn test_num_solutions() {
        let points = [
            Vec3::new([-1.0, 1.0, 2.0]),
            Vec3::new([0.0, 0.0, 2.0]),
            Vec3::new([1.0, 1.0, 2.0]),
        ];
        let directions: Vec<Vec3> = points.iter().map(|p| p.normalized()).collect();
        let solutions = pose_p3p_kneip(
            points[0],
            points[1],
            points[2],
            directions[0],
            directions[1],
            directions[2],
        );
        assert_eq!(solutions.len(), 4);
    }

    #[test]
    fn test_colinear_points_rejected() {
        let points = [
            Vec3::new([-1.0, -1.0, 2.0]),
            Vec3::new([0.0, 0.0, 2.0]),
            Vec3::new([1.0, 1.0, 2.0]),
        ];
        let directions: Vec<Vec3> = points.iter().map(|p| p.normalized()).collect();
        let solutions = pose_p3p_kneip(
            points[0],
            points[1],
            points[2],
            directions[0],
            directions[1],
            directions[2],
        );
        assert!(solutions.is_empty());
    }

    #[test]
    fn test_ground_truth_pose_recovered() {
        let pose = pose_matrix(std::f64::consts::FRAC_PI_4);
        let points = [
            Vec3::new([2.0, 1.0, 2.0]),
            Vec3::new([3.0, -1.0, 2.0]),
            Vec3::new([2.0, -3.0, 3.0]),
        ];
        let directions: Vec<Vec3> = points
            .iter()
            .map(|p| transform(&pose, p).normalized())
            .collect();

        let solutions = pose_p3p_kneip(
            points[0],
            points[1],
            points[2],
            directions[0],
            directions[1],
            directions[2],
        );

        let found = solutions.iter().any(|s| s.is_similar(&pose, 1e-10));
        assert!(found, "no solution matches the ground truth pose");
    }
}
