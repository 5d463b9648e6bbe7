mod tree_determinism;
