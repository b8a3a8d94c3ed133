mod load;
mod prime;
