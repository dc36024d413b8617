pub mod lcacc;
