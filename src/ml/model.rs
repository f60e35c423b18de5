use burn::{
    module::ParamId,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig,
        Linear, LinearConfig,
        PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};

use crate::ml::traits::{BatchNormLayers, Classifier, NamedParameters, RunningStats};

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize
// internally; adding them again gives conflicting impls.
#[derive(Config, Debug)]
pub struct VggConfig {
    pub num_classes: usize,
    /// Output channels of each stage; a 2x2 max-pool follows every stage
    pub stages: Vec<usize>,
    #[config(default = 3)]
    pub in_channels: usize,
    #[config(default = 1)]
    pub convs_per_stage: usize,
}

impl VggConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> VggNet<B> {
        let mut features = Vec::new();
        let mut channels = self.in_channels;
        for &out in &self.stages {
            for _ in 0..self.convs_per_stage.max(1) {
                features.push(ConvBnRelu {
                    conv: Conv2dConfig::new([channels, out], [3, 3])
                        .with_padding(PaddingConfig2d::Explicit(1, 1))
                        .init(device),
                    bn: BatchNormConfig::new(out).init(device),
                });
                channels = out;
            }
        }
        VggNet {
            features,
            pool:            MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            global_pool:     AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            classifier:      LinearConfig::new(channels, self.num_classes).init(device),
            convs_per_stage: self.convs_per_stage.max(1),
        }
    }
}

#[derive(Module, Debug)]
pub struct ConvBnRelu<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn:   BatchNorm<B, 2>,
}

impl<B: Backend> ConvBnRelu<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.bn.forward(self.conv.forward(x)))
    }
}

#[derive(Module, Debug)]
pub struct VggNet<B: Backend> {
    pub features:        Vec<ConvBnRelu<B>>,
    pub pool:            MaxPool2d,
    pub global_pool:     AdaptiveAvgPool2d,
    pub classifier:      Linear<B>,
    pub convs_per_stage: usize,
}

impl<B: Backend> VggNet<B> {
    /// images: [batch, C, H, W] → logits: [batch, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for (i, layer) in self.features.iter().enumerate() {
            x = layer.forward(x);
            if (i + 1) % self.convs_per_stage == 0 {
                x = self.pool.forward(x);
            }
        }
        let x = self.global_pool.forward(x); // [batch, C, 1, 1]
        self.classifier.forward(x.flatten::<2>(1, 3))
    }
}

impl<B: Backend> Classifier<B> for VggNet<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        VggNet::forward(self, images)
    }
}

impl<B: Backend> NamedParameters for VggNet<B> {
    fn named_parameters(&self) -> Vec<(String, ParamId)> {
        let mut params = Vec::new();
        for (i, layer) in self.features.iter().enumerate() {
            params.push((format!("features.{i}.conv.weight"), layer.conv.weight.id));
            if let Some(bias) = &layer.conv.bias {
                params.push((format!("features.{i}.conv.bias"), bias.id));
            }
            params.push((format!("features.{i}.bn.weight"), layer.bn.gamma.id));
            params.push((format!("features.{i}.bn.bias"), layer.bn.beta.id));
        }
        params.push(("classifier.weight".to_string(), self.classifier.weight.id));
        if let Some(bias) = &self.classifier.bias {
            params.push(("classifier.bias".to_string(), bias.id));
        }
        params
    }
}

impl<B: Backend> BatchNormLayers for VggNet<B> {
    fn batch_norms(&self) -> Vec<&dyn RunningStats> {
        self.features
            .iter()
            .map(|layer| &layer.bn as &dyn RunningStats)
            .collect()
    }

    fn batch_norms_mut(&mut self) -> Vec<&mut dyn RunningStats> {
        self.features
            .iter_mut()
            .map(|layer| &mut layer.bn as &mut dyn RunningStats)
            .collect()
    }
}
