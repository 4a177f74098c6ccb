pub mod selfie;
